pub mod approval;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod run_store;

pub use approval::{ApproverList, ApproverPolicy, RequesterOnly};
pub use error::OrchestratorError;
pub use message::{InboundMessage, InboundValidationError, OutboundMessage};
pub use orchestrator::{
    ExecutionCondition, ExecutionOutcome, InboundCondition, InboundOutcome, RunOrchestrator,
    RunSnapshot, Timeline,
};
pub use run_store::{replay_status, Run, RunEvent, RunEventKind, RunStatus, RunStore};
