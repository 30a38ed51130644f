use crate::orchestration::error::OrchestratorError;
use crate::shared::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Created,
    AwaitingApproval,
    Approved,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Denied,
    Canceled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Denied
                | RunStatus::Canceled
                | RunStatus::TimedOut
        )
    }

    /// Status reached by applying `event` to a run currently in `self`, or
    /// `None` when the event is not a legal transition from this status.
    pub fn apply(self, event: RunEventKind) -> Option<RunStatus> {
        use RunEventKind as E;
        use RunStatus as S;

        if self.is_terminal() {
            return None;
        }
        match (self, event) {
            (S::Created, E::ApprovalRequested) => Some(S::AwaitingApproval),
            (S::AwaitingApproval, E::Approved) => Some(S::Approved),
            (S::AwaitingApproval, E::Denied) => Some(S::Denied),
            (S::Approved, E::Dispatched) => Some(S::Dispatching),
            (S::Dispatching, E::Started) => Some(S::Running),
            (S::Running, E::Succeeded) => Some(S::Succeeded),
            (S::Running, E::Failed) => Some(S::Failed),
            (_, E::TimedOut) => Some(S::TimedOut),
            (_, E::Canceled) => Some(S::Canceled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "Created",
            RunStatus::AwaitingApproval => "AwaitingApproval",
            RunStatus::Approved => "Approved",
            RunStatus::Dispatching => "Dispatching",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Denied => "Denied",
            RunStatus::Canceled => "Canceled",
            RunStatus::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunEventKind {
    Created,
    ApprovalRequested,
    Approved,
    Denied,
    Dispatched,
    Started,
    Succeeded,
    Failed,
    TimedOut,
    Canceled,
}

impl RunEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunEventKind::Created => "Created",
            RunEventKind::ApprovalRequested => "ApprovalRequested",
            RunEventKind::Approved => "Approved",
            RunEventKind::Denied => "Denied",
            RunEventKind::Dispatched => "Dispatched",
            RunEventKind::Started => "Started",
            RunEventKind::Succeeded => "Succeeded",
            RunEventKind::Failed => "Failed",
            RunEventKind::TimedOut => "TimedOut",
            RunEventKind::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub job_key: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub requested_by: String,
    pub channel_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: RunEventKind,
    pub at: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Re-derives a run's status from its ordered events.
pub fn replay_status(events: &[RunEvent]) -> Result<RunStatus, String> {
    let Some(first) = events.first() else {
        return Err("run has no events".to_string());
    };
    if first.kind != RunEventKind::Created {
        return Err(format!("first event is `{}`, expected `Created`", first.kind));
    }
    let mut status = RunStatus::Created;
    for event in &events[1..] {
        status = status.apply(event.kind).ok_or_else(|| {
            format!(
                "event #{} `{}` is not a legal transition from `{status}`",
                event.seq, event.kind
            )
        })?;
    }
    Ok(status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRejected {
    pub from: RunStatus,
    pub event: RunEventKind,
}

/// A run together with its event log. The log is authoritative; `run.status`
/// is only ever written by [`RunRecord::append`], in the same step that
/// pushes the event.
#[derive(Debug, Clone)]
pub struct RunRecord {
    run: Run,
    events: Vec<RunEvent>,
}

pub struct NewRun {
    pub run_id: RunId,
    pub job_key: String,
    pub requested_by: String,
    pub channel_id: String,
    pub conversation_id: String,
}

impl RunRecord {
    pub fn create(new_run: NewRun, at: DateTime<Utc>) -> Self {
        let actor = new_run.requested_by.clone();
        let mut payload = Map::new();
        payload.insert("jobKey".to_string(), Value::String(new_run.job_key.clone()));
        let created = RunEvent {
            run_id: new_run.run_id.clone(),
            seq: 1,
            kind: RunEventKind::Created,
            at,
            actor,
            payload,
        };
        Self {
            run: Run {
                run_id: new_run.run_id,
                job_key: new_run.job_key,
                status: RunStatus::Created,
                created_at: at,
                requested_by: new_run.requested_by,
                channel_id: new_run.channel_id,
                conversation_id: new_run.conversation_id,
            },
            events: vec![created],
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn last_event(&self) -> Option<&RunEvent> {
        self.events.last()
    }

    pub fn last_seq(&self) -> u64 {
        self.events.last().map_or(0, |event| event.seq)
    }

    /// Appends `kind` and advances the cached status. Timestamps never go
    /// backwards within one run: an `at` earlier than the previous event is
    /// clamped to it, and `seq` breaks ties.
    pub fn append(
        &mut self,
        kind: RunEventKind,
        actor: &str,
        payload: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<&RunEvent, TransitionRejected> {
        let from = self.run.status;
        let next = from
            .apply(kind)
            .ok_or(TransitionRejected { from, event: kind })?;
        let (seq, at) = match self.events.last() {
            Some(last) => (last.seq + 1, last.at.max(at)),
            None => (1, at),
        };
        self.events.push(RunEvent {
            run_id: self.run.run_id.clone(),
            seq,
            kind,
            at,
            actor: actor.to_string(),
            payload,
        });
        self.run.status = next;
        tracing::debug!(
            event = "run.transition",
            run_id = self.run.run_id.as_str(),
            from = from.as_str(),
            to = next.as_str(),
            "run transitioned"
        );
        Ok(&self.events[self.events.len() - 1])
    }

    /// Checks the cached status against a full replay of the log.
    pub fn verify(&self) -> Result<(), OrchestratorError> {
        let replayed = replay_status(&self.events).map_err(|reason| OrchestratorError::Corrupt {
            run_id: self.run.run_id.to_string(),
            reason,
        })?;
        if replayed != self.run.status {
            return Err(OrchestratorError::Corrupt {
                run_id: self.run.run_id.to_string(),
                reason: format!(
                    "cached status `{}` disagrees with replayed `{replayed}`",
                    self.run.status
                ),
            });
        }
        Ok(())
    }
}

pub type SharedRunRecord = Arc<Mutex<RunRecord>>;

/// Run records keyed by id. The map lock is only held to find or insert a
/// record; mutation happens under the record's own mutex, so unrelated runs
/// never wait on each other.
#[derive(Debug, Default)]
pub struct RunStore {
    runs: RwLock<HashMap<RunId, SharedRunRecord>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` unless its id is already taken.
    pub fn insert(&self, record: RunRecord) -> Result<bool, OrchestratorError> {
        let mut runs = self.runs.write().map_err(|_| OrchestratorError::Poisoned)?;
        match runs.entry(record.run.run_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(record)));
                Ok(true)
            }
        }
    }

    pub fn contains(&self, run_id: &str) -> Result<bool, OrchestratorError> {
        let runs = self.runs.read().map_err(|_| OrchestratorError::Poisoned)?;
        Ok(runs.contains_key(run_id))
    }

    pub fn get(&self, run_id: &str) -> Result<Option<SharedRunRecord>, OrchestratorError> {
        let runs = self.runs.read().map_err(|_| OrchestratorError::Poisoned)?;
        Ok(runs.get(run_id).cloned())
    }

    pub fn run_ids(&self) -> Result<Vec<RunId>, OrchestratorError> {
        let runs = self.runs.read().map_err(|_| OrchestratorError::Poisoned)?;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn len(&self) -> Result<usize, OrchestratorError> {
        let runs = self.runs.read().map_err(|_| OrchestratorError::Poisoned)?;
        Ok(runs.len())
    }

    pub fn is_empty(&self) -> Result<bool, OrchestratorError> {
        Ok(self.len()? == 0)
    }
}

pub fn lock_record(
    record: &SharedRunRecord,
) -> Result<MutexGuard<'_, RunRecord>, OrchestratorError> {
    record.lock().map_err(|_| OrchestratorError::Poisoned)
}
