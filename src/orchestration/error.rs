/// Unexpected orchestrator failures. Domain outcomes such as an unknown run
/// or a rejected transition are reported on the outcome structs instead.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run store lock poisoned")]
    Poisoned,
    #[error("run `{run_id}` event log is corrupt: {reason}")]
    Corrupt { run_id: String, reason: String },
    #[error("failed to allocate run id: {0}")]
    IdGeneration(String),
}
