//! Execution queue: bounded, FIFO, exclusive-claim work distribution.
//!
//! Every backend honors the same contract:
//! - `enqueue` waits for free capacity (pending plus claimed entries) and
//!   gives up without side effects when the cancellation token fires;
//! - `claim_next` hands the oldest pending entry to exactly one worker;
//! - `complete` and `release` only act on entries that are currently
//!   claimed and report [`QueueError::NotClaimed`] otherwise;
//! - `renew_claim` restarts the lock timeout of a claim held by the given
//!   worker, so long executions are not mistaken for crashed ones;
//! - `reclaim_stale` returns claims older than the lock timeout to pending,
//!   and concurrent sweeps never recover the same claim twice.
//!
//! Released entries keep their `queue_id`, so they re-enter the FIFO at their
//! original position.

pub mod dispatch;
pub mod memory;
pub mod sqlite;

pub use dispatch::{EnqueueOutcome, ExecutionDispatch, QueueDepth, QueuedDispatch};
pub use memory::InMemoryExecutionQueue;
pub use sqlite::SqliteExecutionQueue;

use crate::config::{QueueBackend, QueueSettings};
use crate::shared::CancellationToken;
use std::sync::Arc;
use std::time::Duration;

pub const RECLAIM_ERROR_MESSAGE: &str = "claim lock expired";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create queue database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("queue entry {queue_id} is not currently claimed")]
    NotClaimed { queue_id: i64 },
    #[error("queue entry {queue_id} is corrupt: {reason}")]
    Corrupt { queue_id: i64, reason: String },
    #[error("queue state lock poisoned")]
    Poisoned,
    #[error("queue backend `{backend}` is misconfigured: {reason}")]
    Misconfigured { backend: String, reason: String },
}

impl QueueError {
    /// Recoverable misuse (double completion, stale handle) as opposed to a
    /// storage failure.
    pub fn is_not_claimed(&self) -> bool {
        matches!(self, Self::NotClaimed { .. })
    }
}

pub trait ExecutionQueue: Send + Sync {
    fn enqueue(
        &self,
        dispatch: ExecutionDispatch,
        cancel: &CancellationToken,
    ) -> Result<EnqueueOutcome, QueueError>;

    fn claim_next(&self, worker_id: &str) -> Result<Option<QueuedDispatch>, QueueError>;

    fn complete(
        &self,
        queue_id: i64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), QueueError>;

    fn release(&self, queue_id: i64, error_message: Option<&str>) -> Result<(), QueueError>;

    /// Heartbeat for a claim owned by `worker_id`. [`QueueError::NotClaimed`]
    /// once the entry was completed, released or handed to another worker.
    fn renew_claim(&self, queue_id: i64, worker_id: &str) -> Result<(), QueueError>;

    fn reclaim_stale(&self, lock_timeout: Duration) -> Result<usize, QueueError>;

    fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Polls `claim_next` every `poll_interval` until an entry is claimed or
    /// `cancel` fires.
    fn claim_next_blocking(
        &self,
        worker_id: &str,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<QueuedDispatch>, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(claimed) = self.claim_next(worker_id)? {
                return Ok(Some(claimed));
            }
            if !cancel.sleep(poll_interval) {
                return Ok(None);
            }
        }
    }
}

/// Builds the backend selected in configuration.
pub fn open_queue(settings: &QueueSettings) -> Result<Arc<dyn ExecutionQueue>, QueueError> {
    match settings.backend {
        QueueBackend::Memory => Ok(Arc::new(InMemoryExecutionQueue::new(settings.capacity))),
        QueueBackend::Sqlite => {
            let path = settings
                .sqlite_path
                .as_deref()
                .ok_or_else(|| QueueError::Misconfigured {
                    backend: QueueBackend::Sqlite.to_string(),
                    reason: "`sqlite_path` is not set".to_string(),
                })?;
            Ok(Arc::new(SqliteExecutionQueue::open(path, settings.capacity)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_queue_selects_configured_backend() {
        let memory = open_queue(&QueueSettings::default()).expect("memory queue");
        assert_eq!(memory.depth().expect("depth"), QueueDepth::default());

        let dir = tempdir().expect("tempdir");
        let settings = QueueSettings {
            backend: QueueBackend::Sqlite,
            sqlite_path: Some(dir.path().join("state/queue.db")),
            ..QueueSettings::default()
        };
        let durable = open_queue(&settings).expect("sqlite queue");
        assert_eq!(durable.depth().expect("depth").live(), 0);
        assert!(dir.path().join("state/queue.db").exists());
    }

    #[test]
    fn open_queue_rejects_sqlite_without_path() {
        let settings = QueueSettings {
            backend: QueueBackend::Sqlite,
            ..QueueSettings::default()
        };
        let err = open_queue(&settings).err().expect("misconfigured");
        assert!(err.to_string().contains("sqlite_path"));
    }
}
