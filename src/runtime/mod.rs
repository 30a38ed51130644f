pub mod error;
pub mod executor;
pub mod intake;
pub mod queue_worker;
pub mod reclaim;
pub mod sink;
pub mod supervisor;
pub mod worker_registry;

pub use error::RuntimeError;
pub use executor::{ExecutionReport, Executor, ProcessExecutor};
pub use intake::{ChatIntake, IntakeError};
pub use queue_worker::{
    claim_heartbeat_interval, process_next, run_worker_loop, Disposition, PollingConfig,
    ProcessedDispatch, WorkerContext, WorkerError,
};
pub use reclaim::{spawn_reclaim_sweep, ReclaimSweep, RunTimeoutSweep, SweepReport};
pub use sink::{CollectingSink, JsonLinesSink, OutboundSink};
pub use supervisor::{RuntimeParts, Supervisor, SupervisorConfig};
pub use worker_registry::{WorkerEvent, WorkerHealth, WorkerRegistry, WorkerState};
