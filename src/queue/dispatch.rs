use crate::shared::RunId;
use serde::{Deserialize, Serialize};

/// Request to execute one approved run, as handed to [`super::ExecutionQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDispatch {
    pub run_id: RunId,
    pub job_key: String,
}

impl ExecutionDispatch {
    pub fn new(run_id: RunId, job_key: impl Into<String>) -> Self {
        Self {
            run_id,
            job_key: job_key.into(),
        }
    }
}

/// A dispatch as seen by a worker after a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedDispatch {
    pub queue_id: i64,
    pub run_id: RunId,
    pub job_key: String,
    pub attempts: u32,
}

impl QueuedDispatch {
    pub fn dispatch(&self) -> ExecutionDispatch {
        ExecutionDispatch::new(self.run_id.clone(), self.job_key.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { queue_id: i64 },
    Canceled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: usize,
    pub claimed: usize,
}

impl QueueDepth {
    pub fn live(&self) -> usize {
        self.pending + self.claimed
    }
}
