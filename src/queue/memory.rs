use super::{
    EnqueueOutcome, ExecutionDispatch, ExecutionQueue, QueueDepth, QueueError, QueuedDispatch,
    RECLAIM_ERROR_MESSAGE,
};
use crate::shared::CancellationToken;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const ENQUEUE_WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Claim {
    worker_id: String,
    claimed_at: Instant,
}

#[derive(Debug)]
struct Entry {
    dispatch: QueuedDispatch,
    claim: Option<Claim>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct QueueState {
    next_queue_id: i64,
    entries: BTreeMap<i64, Entry>,
    pending: BTreeSet<i64>,
}

impl QueueState {
    fn release_claim(&mut self, queue_id: i64, error_message: Option<&str>) -> bool {
        let Some(entry) = self.entries.get_mut(&queue_id) else {
            return false;
        };
        if entry.claim.take().is_none() {
            return false;
        }
        entry.dispatch.attempts = entry.dispatch.attempts.saturating_add(1);
        entry.last_error = error_message.map(str::to_string);
        self.pending.insert(queue_id);
        true
    }
}

/// Volatile queue; all state lives behind one mutex, so every transition is
/// atomic with respect to concurrent callers.
#[derive(Debug)]
pub struct InMemoryExecutionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    space_available: Condvar,
}

impl InMemoryExecutionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                next_queue_id: 1,
                entries: BTreeMap::new(),
                pending: BTreeSet::new(),
            }),
            space_available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last error recorded by `release` or `reclaim_stale` for a live entry.
    pub fn last_error(&self, queue_id: i64) -> Result<Option<String>, QueueError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .get(&queue_id)
            .and_then(|entry| entry.last_error.clone()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }
}

impl ExecutionQueue for InMemoryExecutionQueue {
    fn enqueue(
        &self,
        dispatch: ExecutionDispatch,
        cancel: &CancellationToken,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.lock()?;
        loop {
            if cancel.is_cancelled() {
                return Ok(EnqueueOutcome::Canceled);
            }
            if state.entries.len() < self.capacity {
                break;
            }
            let (guard, _) = self
                .space_available
                .wait_timeout(state, ENQUEUE_WAIT_SLICE)
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }

        let queue_id = state.next_queue_id;
        state.next_queue_id += 1;
        state.entries.insert(
            queue_id,
            Entry {
                dispatch: QueuedDispatch {
                    queue_id,
                    run_id: dispatch.run_id,
                    job_key: dispatch.job_key,
                    attempts: 0,
                },
                claim: None,
                last_error: None,
            },
        );
        state.pending.insert(queue_id);
        tracing::debug!(event = "queue.enqueued", queue_id, "dispatch enqueued");
        Ok(EnqueueOutcome::Enqueued { queue_id })
    }

    fn claim_next(&self, worker_id: &str) -> Result<Option<QueuedDispatch>, QueueError> {
        let mut state = self.lock()?;
        let Some(queue_id) = state.pending.pop_first() else {
            return Ok(None);
        };
        let entry = state
            .entries
            .get_mut(&queue_id)
            .ok_or_else(|| QueueError::Corrupt {
                queue_id,
                reason: "pending id has no entry".to_string(),
            })?;
        entry.claim = Some(Claim {
            worker_id: worker_id.to_string(),
            claimed_at: Instant::now(),
        });
        tracing::debug!(event = "queue.claimed", queue_id, worker_id, "dispatch claimed");
        Ok(Some(entry.dispatch.clone()))
    }

    fn complete(
        &self,
        queue_id: i64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let claimed = state
            .entries
            .get(&queue_id)
            .is_some_and(|entry| entry.claim.is_some());
        if !claimed {
            return Err(QueueError::NotClaimed { queue_id });
        }
        if let Some(entry) = state.entries.remove(&queue_id) {
            let worker_id = entry.claim.map(|claim| claim.worker_id).unwrap_or_default();
            tracing::debug!(
                event = "queue.completed",
                queue_id,
                worker_id = worker_id.as_str(),
                success,
                error = error_message.unwrap_or(""),
                "dispatch completed"
            );
        }
        drop(state);
        self.space_available.notify_one();
        Ok(())
    }

    fn release(&self, queue_id: i64, error_message: Option<&str>) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if !state.release_claim(queue_id, error_message) {
            return Err(QueueError::NotClaimed { queue_id });
        }
        tracing::info!(event = "queue.released", queue_id, "dispatch released for retry");
        Ok(())
    }

    fn renew_claim(&self, queue_id: i64, worker_id: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let claim = state
            .entries
            .get_mut(&queue_id)
            .and_then(|entry| entry.claim.as_mut())
            .filter(|claim| claim.worker_id == worker_id)
            .ok_or(QueueError::NotClaimed { queue_id })?;
        claim.claimed_at = Instant::now();
        Ok(())
    }

    fn reclaim_stale(&self, lock_timeout: Duration) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let stale: Vec<i64> = state
            .entries
            .iter()
            .filter_map(|(queue_id, entry)| {
                entry
                    .claim
                    .as_ref()
                    .filter(|claim| now.saturating_duration_since(claim.claimed_at) >= lock_timeout)
                    .map(|_| *queue_id)
            })
            .collect();

        let mut recovered = 0;
        for queue_id in stale {
            if state.release_claim(queue_id, Some(RECLAIM_ERROR_MESSAGE)) {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(
                event = "queue.reclaimed",
                recovered,
                "stale claims returned to pending"
            );
        }
        Ok(recovered)
    }

    fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.lock()?;
        let pending = state.pending.len();
        Ok(QueueDepth {
            pending,
            claimed: state.entries.len() - pending,
        })
    }
}
