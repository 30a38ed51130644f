use crate::config::Settings;
use crate::orchestration::{ApproverList, InboundMessage, RunOrchestrator};
use crate::queue::{open_queue, ExecutionQueue};
use crate::runtime::{
    ChatIntake, Executor, OutboundSink, RuntimeParts, Supervisor, SupervisorConfig,
};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

pub const CONSOLE_SENDER: &str = "console";
pub const CONSOLE_CONVERSATION: &str = "console";
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub received: usize,
    pub rejected: usize,
}

/// A line is either a JSON inbound message or plain chat text from the
/// console sender. Blank lines are skipped.
pub fn decode_line(line: &str) -> Option<Result<InboundMessage, String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        return Some(
            serde_json::from_str::<InboundMessage>(trimmed)
                .map_err(|err| format!("invalid inbound message json: {err}")),
        );
    }
    Some(Ok(InboundMessage::new(
        CONSOLE_SENDER,
        CONSOLE_CONVERSATION,
        trimmed,
    )))
}

/// Runs the full runtime against a line-oriented channel. Returns once the
/// input is exhausted and every queued dispatch has finished.
pub fn serve<R: BufRead>(
    settings: &Settings,
    input: R,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn OutboundSink>,
) -> Result<ServeSummary, String> {
    let queue = open_queue(&settings.queue).map_err(|e| e.to_string())?;
    let orchestrator = Arc::new(RunOrchestrator::new(ApproverList::from_settings(
        &settings.approval,
    )));
    let supervisor = Supervisor::start(
        &SupervisorConfig::from_settings(settings),
        RuntimeParts {
            queue: queue.clone(),
            orchestrator: orchestrator.clone(),
            executor,
            sink: sink.clone(),
        },
    )
    .map_err(|e| e.to_string())?;
    let cancel = supervisor.cancellation();
    let intake = ChatIntake::new(orchestrator, queue.clone(), sink);

    let mut summary = ServeSummary::default();
    for line in input.lines() {
        let line = line.map_err(|e| format!("failed to read input: {e}"))?;
        let Some(decoded) = decode_line(&line) else {
            continue;
        };
        summary.received += 1;
        let accepted = decoded.and_then(|msg| {
            intake
                .receive(&msg, &cancel)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        if let Err(err) = accepted {
            summary.rejected += 1;
            tracing::warn!(event = "serve.line_rejected", error = %err, "input line rejected");
        }
    }

    wait_for_drain(queue.as_ref(), &supervisor.cancellation());
    supervisor.shutdown();
    Ok(summary)
}

fn wait_for_drain(queue: &dyn ExecutionQueue, cancel: &crate::shared::CancellationToken) {
    loop {
        match queue.depth() {
            Ok(depth) if depth.live() == 0 => return,
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    event = "queue.depth_failed",
                    error = %err,
                    "cannot read queue depth"
                );
                return;
            }
        }
        if !cancel.sleep(DRAIN_POLL_INTERVAL) {
            return;
        }
    }
}
