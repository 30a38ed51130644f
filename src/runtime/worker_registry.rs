use crate::shared::time::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
        at: i64,
    },
    Error {
        worker_id: String,
        at: i64,
        message: String,
    },
    Stopped {
        worker_id: String,
        at: i64,
    },
}

impl WorkerEvent {
    pub fn started(worker_id: &str) -> Self {
        Self::Started {
            worker_id: worker_id.to_string(),
            at: now_millis(),
        }
    }

    pub fn error(worker_id: &str, message: impl Into<String>) -> Self {
        Self::Error {
            worker_id: worker_id.to_string(),
            at: now_millis(),
            message: message.into(),
        }
    }

    pub fn stopped(worker_id: &str) -> Self {
        Self::Stopped {
            worker_id: worker_id.to_string(),
            at: now_millis(),
        }
    }

    pub fn worker_id(&self) -> &str {
        match self {
            Self::Started { worker_id, .. }
            | Self::Error { worker_id, .. }
            | Self::Stopped { worker_id, .. } => worker_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub error_count: u64,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
}

/// Health of every worker the supervisor started, folded from the events the
/// workers report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerHealth>,
}

impl WorkerRegistry {
    pub fn register(&mut self, worker_id: &str) {
        self.workers.entry(worker_id.to_string()).or_default();
    }

    /// Errors are not fatal: a worker that reported one keeps running, so its
    /// state only changes on start/stop.
    pub fn apply(&mut self, event: WorkerEvent) {
        let health = self
            .workers
            .entry(event.worker_id().to_string())
            .or_default();
        match event {
            WorkerEvent::Started { at, .. } => {
                health.state = WorkerState::Running;
                health.started_at = Some(at);
                health.stopped_at = None;
            }
            WorkerEvent::Error { at, message, .. } => {
                health.error_count += 1;
                health.last_error = Some(message);
                health.last_error_at = Some(at);
                if health.state == WorkerState::Stopped {
                    health.state = WorkerState::Error;
                }
            }
            WorkerEvent::Stopped { at, .. } => {
                health.state = WorkerState::Stopped;
                health.stopped_at = Some(at);
            }
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerHealth> {
        self.workers.get(worker_id)
    }

    pub fn all(&self) -> &BTreeMap<String, WorkerHealth> {
        &self.workers
    }

    pub fn running(&self) -> usize {
        self.workers
            .values()
            .filter(|health| health.state == WorkerState::Running)
            .count()
    }
}
