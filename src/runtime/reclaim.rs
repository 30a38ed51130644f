use crate::orchestration::RunOrchestrator;
use crate::queue::ExecutionQueue;
use crate::runtime::sink::{deliver_all, OutboundSink};
use crate::runtime::worker_registry::WorkerEvent;
use crate::shared::time::now_utc;
use crate::shared::CancellationToken;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const RECLAIM_WORKER_ID: &str = "reclaim-sweep";

/// Times out runs older than `max_age` on every sweep tick.
#[derive(Clone)]
pub struct RunTimeoutSweep {
    pub orchestrator: Arc<RunOrchestrator>,
    pub max_age: Duration,
    pub sink: Arc<dyn OutboundSink>,
}

#[derive(Clone)]
pub struct ReclaimSweep {
    pub queue: Arc<dyn ExecutionQueue>,
    pub interval: Duration,
    pub lock_timeout: Duration,
    pub run_timeout: Option<RunTimeoutSweep>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub timed_out: usize,
    pub errors: usize,
}

impl ReclaimSweep {
    /// One pass: return stale claims to the queue, then time out old runs.
    pub fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();
        match self.queue.reclaim_stale(self.lock_timeout) {
            Ok(reclaimed) => report.reclaimed = reclaimed,
            Err(err) => {
                report.errors += 1;
                tracing::error!(
                    event = "queue.reclaim_failed",
                    error = %err,
                    "reclaim sweep failed"
                );
            }
        }

        if let Some(timeouts) = &self.run_timeout {
            match timeouts
                .orchestrator
                .time_out_stale_runs(timeouts.max_age, now_utc())
            {
                Ok(outcomes) => {
                    report.timed_out = outcomes.len();
                    for outcome in &outcomes {
                        tracing::warn!(
                            event = "run.timed_out",
                            run_id = %outcome.run_id,
                            "run exceeded its maximum age"
                        );
                        deliver_all(timeouts.sink.as_ref(), &outcome.outbound);
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::error!(
                        event = "run.timeout_sweep_failed",
                        error = %err,
                        "run timeout sweep failed"
                    );
                }
            }
        }
        report
    }
}

/// Runs [`ReclaimSweep::tick`] every `sweep.interval` on a background thread
/// until `cancel` fires.
pub fn spawn_reclaim_sweep(
    sweep: ReclaimSweep,
    cancel: CancellationToken,
    events: Option<Sender<WorkerEvent>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(RECLAIM_WORKER_ID.to_string())
        .spawn(move || {
            let report = |event: WorkerEvent| {
                if let Some(events) = &events {
                    let _ = events.send(event);
                }
            };
            report(WorkerEvent::started(RECLAIM_WORKER_ID));
            while cancel.sleep(sweep.interval) {
                let tick = sweep.tick();
                if tick.errors > 0 {
                    report(WorkerEvent::error(
                        RECLAIM_WORKER_ID,
                        format!("{} sweep step(s) failed", tick.errors),
                    ));
                }
            }
            report(WorkerEvent::stopped(RECLAIM_WORKER_ID));
        })
}
