use crate::config::Settings;
use crate::orchestration::RunOrchestrator;
use crate::queue::ExecutionQueue;
use crate::runtime::error::RuntimeError;
use crate::runtime::executor::Executor;
use crate::runtime::queue_worker::{
    claim_heartbeat_interval, run_worker_loop, PollingConfig, WorkerContext,
};
use crate::runtime::reclaim::{
    spawn_reclaim_sweep, ReclaimSweep, RunTimeoutSweep, RECLAIM_WORKER_ID,
};
use crate::runtime::sink::OutboundSink;
use crate::runtime::worker_registry::{WorkerEvent, WorkerRegistry};
use crate::shared::CancellationToken;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    pub polling: PollingConfig,
    pub lock_timeout: Duration,
    pub reclaim_interval: Duration,
    pub run_timeout: Option<Duration>,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            worker_count: settings.workers.count,
            polling: PollingConfig::from_settings(&settings.workers),
            lock_timeout: settings.queue.lock_timeout(),
            reclaim_interval: settings.queue.reclaim_interval(),
            run_timeout: settings.runs.timeout(),
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct RuntimeParts {
    pub queue: Arc<dyn ExecutionQueue>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub executor: Arc<dyn Executor>,
    pub sink: Arc<dyn OutboundSink>,
}

/// Owns the worker threads and the reclaim sweep. Dropping a running
/// supervisor cancels it without waiting; call [`Supervisor::shutdown`] to
/// join.
pub struct Supervisor {
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
    events: Receiver<WorkerEvent>,
    registry: WorkerRegistry,
}

impl Supervisor {
    pub fn start(config: &SupervisorConfig, parts: RuntimeParts) -> Result<Self, RuntimeError> {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
        let mut supervisor = Self {
            cancel: cancel.clone(),
            handles: Vec::new(),
            events: events_rx,
            registry: WorkerRegistry::default(),
        };

        for index in 1..=config.worker_count {
            let worker_id = format!("worker-{index}");
            supervisor.registry.register(&worker_id);
            let ctx = WorkerContext {
                worker_id: worker_id.clone(),
                queue: parts.queue.clone(),
                orchestrator: parts.orchestrator.clone(),
                executor: parts.executor.clone(),
                sink: parts.sink.clone(),
                polling: config.polling,
                claim_heartbeat: claim_heartbeat_interval(config.lock_timeout),
                cancel: cancel.clone(),
            };
            let tx = events_tx.clone();
            let spawned = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || run_worker_loop(ctx, Some(tx)));
            match spawned {
                Ok(handle) => supervisor.handles.push((worker_id, handle)),
                Err(source) => {
                    supervisor.stop_and_join();
                    return Err(RuntimeError::Spawn { worker_id, source });
                }
            }
        }

        let sweep = ReclaimSweep {
            queue: parts.queue.clone(),
            interval: config.reclaim_interval,
            lock_timeout: config.lock_timeout,
            run_timeout: config.run_timeout.map(|max_age| RunTimeoutSweep {
                orchestrator: parts.orchestrator.clone(),
                max_age,
                sink: parts.sink.clone(),
            }),
        };
        supervisor.registry.register(RECLAIM_WORKER_ID);
        match spawn_reclaim_sweep(sweep, cancel, Some(events_tx)) {
            Ok(handle) => supervisor
                .handles
                .push((RECLAIM_WORKER_ID.to_string(), handle)),
            Err(source) => {
                supervisor.stop_and_join();
                return Err(RuntimeError::Spawn {
                    worker_id: RECLAIM_WORKER_ID.to_string(),
                    source,
                });
            }
        }

        tracing::info!(
            event = "supervisor.started",
            workers = config.worker_count,
            "supervisor started"
        );
        Ok(supervisor)
    }

    /// Token shared with every worker. Cancelling it stops the runtime.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Folds pending worker events into the registry.
    pub fn health(&mut self) -> &WorkerRegistry {
        while let Ok(event) = self.events.try_recv() {
            self.registry.apply(event);
        }
        &self.registry
    }

    /// Cancels every worker and waits for them to exit.
    pub fn shutdown(mut self) -> WorkerRegistry {
        self.stop_and_join();
        tracing::info!(event = "supervisor.stopped", "supervisor stopped");
        self.health().clone()
    }

    fn stop_and_join(&mut self) {
        self.cancel.cancel();
        for (worker_id, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!(
                    event = "worker.panicked",
                    worker_id = %worker_id,
                    "worker thread panicked"
                );
                self.registry
                    .apply(WorkerEvent::error(&worker_id, "worker thread panicked"));
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
