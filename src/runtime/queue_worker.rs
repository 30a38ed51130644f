use crate::config::WorkerSettings;
use crate::orchestration::{RunOrchestrator, RunStatus};
use crate::queue::{ExecutionQueue, QueueError, QueuedDispatch};
use crate::runtime::executor::Executor;
use crate::runtime::sink::{deliver_all, OutboundSink};
use crate::runtime::worker_registry::WorkerEvent;
use crate::shared::CancellationToken;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const QUEUE_MIN_POLL_MS: u64 = 100;
pub const QUEUE_MAX_POLL_MS: u64 = 1000;
pub const SHUTDOWN_RELEASE_MESSAGE: &str = "worker shutdown";

const MIN_CLAIM_HEARTBEAT: Duration = Duration::from_millis(10);

/// Renews a claim three times per lock timeout.
pub fn claim_heartbeat_interval(lock_timeout: Duration) -> Duration {
    (lock_timeout / 3).max(MIN_CLAIM_HEARTBEAT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub min_poll: Duration,
    pub max_poll: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_poll: Duration::from_millis(QUEUE_MIN_POLL_MS),
            max_poll: Duration::from_millis(QUEUE_MAX_POLL_MS),
        }
    }
}

impl PollingConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            min_poll: Duration::from_millis(settings.min_poll_ms),
            max_poll: Duration::from_millis(settings.max_poll_ms.max(settings.min_poll_ms)),
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(self.max_poll)
            .max(self.min_poll)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("orchestrator rejected queue entry {queue_id}: {message}")]
    Orchestrator { queue_id: i64, message: String },
}

/// What happened to one claimed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Executed { success: bool },
    /// The run was no longer dispatchable; the entry was completed unrun.
    Skipped { status: Option<RunStatus> },
    /// Shutdown stopped the execution. The entry went back to pending and
    /// the run was left `Running`.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedDispatch {
    pub queue_id: i64,
    pub run_id: String,
    pub disposition: Disposition,
}

#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub queue: Arc<dyn ExecutionQueue>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub executor: Arc<dyn Executor>,
    pub sink: Arc<dyn OutboundSink>,
    pub polling: PollingConfig,
    /// How often a claim is renewed while its job executes.
    pub claim_heartbeat: Duration,
    pub cancel: CancellationToken,
}

/// Claims and executes entries until `ctx.cancel` fires. Errors on one entry
/// are reported and the loop moves on.
pub fn run_worker_loop(ctx: WorkerContext, events: Option<Sender<WorkerEvent>>) {
    let report = |event: WorkerEvent| {
        if let Some(events) = &events {
            let _ = events.send(event);
        }
    };

    tracing::info!(event = "worker.started", worker_id = %ctx.worker_id, "worker started");
    report(WorkerEvent::started(&ctx.worker_id));

    let mut backoff = ctx.polling.min_poll;
    while !ctx.cancel.is_cancelled() {
        match process_next(&ctx) {
            Ok(Some(_)) => backoff = ctx.polling.min_poll,
            Ok(None) => {
                if !ctx.cancel.sleep(backoff) {
                    break;
                }
                backoff = ctx.polling.next_backoff(backoff);
            }
            Err(err) => {
                tracing::error!(
                    event = "worker.error",
                    worker_id = %ctx.worker_id,
                    error = %err,
                    "worker failed to process queue entry"
                );
                report(WorkerEvent::error(&ctx.worker_id, err.to_string()));
                if !ctx.cancel.sleep(backoff) {
                    break;
                }
                backoff = ctx.polling.next_backoff(backoff);
            }
        }
    }

    tracing::info!(event = "worker.stopped", worker_id = %ctx.worker_id, "worker stopped");
    report(WorkerEvent::stopped(&ctx.worker_id));
}

/// Claims at most one entry and drives it to completion. `Ok(None)` when the
/// queue had nothing pending.
pub fn process_next(ctx: &WorkerContext) -> Result<Option<ProcessedDispatch>, WorkerError> {
    let Some(claimed) = ctx.queue.claim_next(&ctx.worker_id)? else {
        return Ok(None);
    };
    process_claimed(ctx, claimed).map(Some)
}

pub fn process_claimed(
    ctx: &WorkerContext,
    claimed: QueuedDispatch,
) -> Result<ProcessedDispatch, WorkerError> {
    let queue_id = claimed.queue_id;
    let run_id = claimed.run_id.to_string();

    let started = match ctx
        .orchestrator
        .on_execution_started(&run_id, &ctx.worker_id)
    {
        Ok(started) => started,
        Err(err) => return Err(release_after(ctx, queue_id, err.to_string())),
    };
    deliver_all(ctx.sink.as_ref(), &started.outbound);

    // A reclaimed entry whose run is already running is executed again: the
    // previous claimant stopped renewing its claim and never reported
    // completion.
    if started.status != Some(RunStatus::Running) {
        let reason = match started.status {
            Some(status) => format!("run is {status}; execution skipped"),
            None => "run not found; execution skipped".to_string(),
        };
        tracing::info!(
            event = "worker.skipped",
            worker_id = %ctx.worker_id,
            queue_id,
            run_id = %run_id,
            reason = %reason,
            "queue entry skipped"
        );
        finish_entry(ctx, queue_id, false, Some(&reason))?;
        return Ok(ProcessedDispatch {
            queue_id,
            run_id,
            disposition: Disposition::Skipped {
                status: started.status,
            },
        });
    }

    let heartbeat_stop = CancellationToken::new();
    let (report, claim_lost) = thread::scope(|scope| {
        let heartbeat = scope.spawn(|| keep_claim_alive(ctx, queue_id, &heartbeat_stop));
        let report = ctx.executor.execute(&claimed.dispatch(), &ctx.cancel);
        heartbeat_stop.cancel();
        (report, heartbeat.join().unwrap_or(false))
    });

    if !report.success && ctx.cancel.is_cancelled() {
        tracing::info!(
            event = "worker.interrupted",
            worker_id = %ctx.worker_id,
            queue_id,
            run_id = %run_id,
            "execution stopped by shutdown; entry returned to pending"
        );
        if !claim_lost {
            release_entry(ctx, queue_id, SHUTDOWN_RELEASE_MESSAGE)?;
        }
        return Ok(ProcessedDispatch {
            queue_id,
            run_id,
            disposition: Disposition::Interrupted,
        });
    }

    let completed = match ctx.orchestrator.on_execution_completed(
        &run_id,
        &ctx.worker_id,
        report.success,
        &report.summary,
    ) {
        Ok(completed) => completed,
        Err(err) => return Err(release_after(ctx, queue_id, err.to_string())),
    };
    deliver_all(ctx.sink.as_ref(), &completed.outbound);

    if !claim_lost {
        let error_message = (!report.success).then_some(report.summary.as_str());
        finish_entry(ctx, queue_id, report.success, error_message)?;
    }
    Ok(ProcessedDispatch {
        queue_id,
        run_id,
        disposition: Disposition::Executed {
            success: report.success,
        },
    })
}

/// Renews the claim on `queue_id` until `stop` fires. Returns `true` when the
/// claim was lost, after which the entry belongs to someone else.
fn keep_claim_alive(ctx: &WorkerContext, queue_id: i64, stop: &CancellationToken) -> bool {
    while stop.sleep(ctx.claim_heartbeat) {
        match ctx.queue.renew_claim(queue_id, &ctx.worker_id) {
            Ok(()) => {}
            Err(err) if err.is_not_claimed() => {
                tracing::warn!(
                    event = "queue.claim_lost",
                    worker_id = %ctx.worker_id,
                    queue_id,
                    "claim was taken away during execution"
                );
                return true;
            }
            Err(err) => {
                tracing::warn!(
                    event = "queue.renew_failed",
                    worker_id = %ctx.worker_id,
                    queue_id,
                    error = %err,
                    "failed to renew claim"
                );
            }
        }
    }
    false
}

fn release_entry(ctx: &WorkerContext, queue_id: i64, reason: &str) -> Result<(), WorkerError> {
    match ctx.queue.release(queue_id, Some(reason)) {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_claimed() => {
            tracing::warn!(
                event = "queue.release_rejected",
                worker_id = %ctx.worker_id,
                queue_id,
                error = %err,
                "queue entry was no longer claimed at release"
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// A reclaim may have taken the entry away while we worked on it; that is
/// logged, not an error.
fn finish_entry(
    ctx: &WorkerContext,
    queue_id: i64,
    success: bool,
    error_message: Option<&str>,
) -> Result<(), WorkerError> {
    match ctx.queue.complete(queue_id, success, error_message) {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_claimed() => {
            tracing::warn!(
                event = "queue.complete_rejected",
                worker_id = %ctx.worker_id,
                queue_id,
                error = %err,
                "queue entry was no longer claimed at completion"
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn release_after(ctx: &WorkerContext, queue_id: i64, message: String) -> WorkerError {
    if let Err(err) = ctx.queue.release(queue_id, Some(&message)) {
        tracing::error!(
            event = "worker.error",
            worker_id = %ctx.worker_id,
            queue_id,
            error = %err,
            "failed to release queue entry"
        );
    }
    WorkerError::Orchestrator { queue_id, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let polling = PollingConfig::default();
        let mut backoff = polling.min_poll;
        let mut seen = Vec::new();
        for _ in 0..6 {
            backoff = polling.next_backoff(backoff);
            seen.push(backoff.as_millis());
        }
        assert_eq!(seen, vec![200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn heartbeat_runs_well_inside_the_lock_timeout() {
        assert_eq!(
            claim_heartbeat_interval(Duration::from_secs(300)),
            Duration::from_secs(100)
        );
        assert_eq!(claim_heartbeat_interval(Duration::ZERO), MIN_CLAIM_HEARTBEAT);
    }

    #[test]
    fn polling_from_settings_never_inverts_bounds() {
        let polling = PollingConfig::from_settings(&WorkerSettings {
            count: 1,
            min_poll_ms: 500,
            max_poll_ms: 100,
        });
        assert_eq!(polling.min_poll, polling.max_poll);
    }
}
