use crate::intent;
use crate::orchestration::{
    InboundMessage, InboundOutcome, InboundValidationError, OrchestratorError, RunOrchestrator,
};
use crate::queue::{EnqueueOutcome, ExecutionQueue, QueueError};
use crate::runtime::sink::{deliver_all, OutboundSink};
use crate::shared::CancellationToken;
use std::sync::Arc;

const INTAKE_ACTOR: &str = "intake";

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] InboundValidationError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to enqueue run {run_id}: {source}")]
    Queue {
        run_id: String,
        #[source]
        source: QueueError,
    },
    #[error("enqueue of run {run_id} was canceled")]
    Canceled { run_id: String },
}

/// Chat-facing entry point: validates, parses, hands the message to the
/// orchestrator and enqueues any dispatch it produced.
///
/// A run whose dispatch cannot be enqueued is canceled so it does not sit in
/// `dispatching` forever.
pub struct ChatIntake {
    orchestrator: Arc<RunOrchestrator>,
    queue: Arc<dyn ExecutionQueue>,
    sink: Arc<dyn OutboundSink>,
}

impl ChatIntake {
    pub fn new(
        orchestrator: Arc<RunOrchestrator>,
        queue: Arc<dyn ExecutionQueue>,
        sink: Arc<dyn OutboundSink>,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            sink,
        }
    }

    /// Blocks while the queue is full, until `cancel` fires.
    pub fn receive(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<InboundOutcome, IntakeError> {
        if let Err(err) = msg.validate() {
            tracing::warn!(
                event = "intake.rejected",
                channel = %msg.channel,
                conversation = %msg.conversation,
                error = %err,
                "inbound message rejected"
            );
            return Err(err.into());
        }

        let parsed = intent::parse(&msg.body);
        let outcome = self.orchestrator.handle_inbound(msg, &parsed)?;

        if let Some(dispatch) = outcome.dispatch.clone() {
            let run_id = dispatch.run_id.to_string();
            match self.queue.enqueue(dispatch, cancel) {
                Ok(EnqueueOutcome::Enqueued { .. }) => {}
                Ok(EnqueueOutcome::Canceled) => {
                    self.abandon(&run_id, "enqueue canceled before the queue had room")?;
                    return Err(IntakeError::Canceled { run_id });
                }
                Err(source) => {
                    self.abandon(&run_id, &format!("enqueue failed: {source}"))?;
                    return Err(IntakeError::Queue { run_id, source });
                }
            }
        }

        deliver_all(self.sink.as_ref(), &outcome.outbound);
        Ok(outcome)
    }

    fn abandon(&self, run_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let canceled = self.orchestrator.cancel_run(run_id, INTAKE_ACTOR, reason)?;
        deliver_all(self.sink.as_ref(), &canceled.outbound);
        Ok(())
    }
}
