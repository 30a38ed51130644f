use crate::intent::{IntentType, ParsedIntent};
use crate::orchestration::approval::{ApproverPolicy, RequesterOnly};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::message::{InboundMessage, OutboundMessage};
use crate::orchestration::run_store::{
    lock_record, NewRun, Run, RunEvent, RunEventKind, RunRecord, RunStatus, RunStore,
};
use crate::queue::ExecutionDispatch;
use crate::shared::time::now_utc;
use crate::shared::{generate_run_id, RunId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const RUN_ID_MAX_GENERATION_ATTEMPTS: usize = 16;
const ORCHESTRATOR_ACTOR: &str = "runbridge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InboundCondition {
    #[serde(rename_all = "camelCase")]
    NotFound { run_id: String },
    #[serde(rename_all = "camelCase")]
    InvalidTransition { run_id: String, status: RunStatus },
    #[serde(rename_all = "camelCase")]
    Unauthorized { run_id: String, sender: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundOutcome {
    pub intent_type: IntentType,
    pub job_key: Option<String>,
    pub run_id: Option<String>,
    pub dispatched_execution: bool,
    pub outbound: Vec<OutboundMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<ExecutionDispatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<InboundCondition>,
}

impl InboundOutcome {
    fn from_intent(intent: &ParsedIntent) -> Self {
        Self {
            intent_type: intent.intent_type,
            job_key: intent.job_key.clone(),
            run_id: intent.run_id.clone(),
            dispatched_execution: false,
            outbound: Vec::new(),
            dispatch: None,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExecutionCondition {
    NotFound,
    /// Already applied, or superseded by a terminal state; safe to ignore.
    Duplicate,
    InvalidTransition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub run_id: String,
    pub status: Option<RunStatus>,
    pub applied: bool,
    pub outbound: Vec<OutboundMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ExecutionCondition>,
}

impl ExecutionOutcome {
    fn not_found(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: None,
            applied: false,
            outbound: Vec::new(),
            condition: Some(ExecutionCondition::NotFound),
        }
    }

    fn unchanged(run_id: &str, status: RunStatus, condition: ExecutionCondition) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: Some(status),
            applied: false,
            outbound: Vec::new(),
            condition: Some(condition),
        }
    }

    fn applied(run_id: &str, status: RunStatus, outbound: Vec<OutboundMessage>) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: Some(status),
            applied: true,
            outbound,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub job_key: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub requested_by_address: String,
    pub channel_id: String,
    pub conversation_id: String,
}

impl From<&Run> for RunSnapshot {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.to_string(),
            job_key: run.job_key.clone(),
            status: run.status,
            created_at: run.created_at,
            requested_by_address: run.requested_by.clone(),
            channel_id: run.channel_id.clone(),
            conversation_id: run.conversation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub run: RunSnapshot,
    pub events: Vec<RunEvent>,
}

/// Owns every run and its event log.
///
/// Chat-side calls arrive through [`RunOrchestrator::handle_inbound`];
/// execution-side calls through the `on_execution_*` callbacks. Neither path
/// performs I/O: dispatches and replies are returned to the caller.
pub struct RunOrchestrator {
    store: RunStore,
    policy: Box<dyn ApproverPolicy>,
    receipts: AtomicU64,
}

impl Default for RunOrchestrator {
    fn default() -> Self {
        Self::new(RequesterOnly)
    }
}

impl RunOrchestrator {
    pub fn new(policy: impl ApproverPolicy + 'static) -> Self {
        Self {
            store: RunStore::new(),
            policy: Box::new(policy),
            receipts: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn handle_inbound(
        &self,
        msg: &InboundMessage,
        intent: &ParsedIntent,
    ) -> Result<InboundOutcome, OrchestratorError> {
        let mut outcome = InboundOutcome::from_intent(intent);
        let replies = self.reply_context(msg);
        match intent.intent_type {
            IntentType::RunJob => {
                let Some(job_key) = intent.job_key.as_deref() else {
                    return Ok(guidance(&replies, outcome));
                };
                let (run_id, outbound) = self.create_run(msg, job_key)?;
                outcome.run_id = Some(run_id.to_string());
                outcome.outbound.push(outbound);
            }
            IntentType::ApproveRun | IntentType::DenyRun => {
                let Some(run_id) = intent.run_id.as_deref() else {
                    return Ok(guidance(&replies, outcome));
                };
                self.decide(&replies, run_id, intent.intent_type, &mut outcome)?;
            }
            IntentType::Status => {
                let Some(run_id) = intent.run_id.as_deref() else {
                    return Ok(guidance(&replies, outcome));
                };
                match self.get_timeline(run_id)? {
                    Some(timeline) => {
                        let seq = timeline.events.last().map_or(0, |event| event.seq);
                        outcome.outbound.push(replies.about_state(
                            "status",
                            seq,
                            timeline.run.status,
                            render_status(&timeline),
                        ));
                    }
                    None => {
                        outcome.outbound.push(not_found_reply(&replies, run_id));
                        outcome.condition = Some(InboundCondition::NotFound {
                            run_id: run_id.to_string(),
                        });
                    }
                }
            }
            IntentType::Unknown => return Ok(guidance(&replies, outcome)),
        }
        Ok(outcome)
    }

    fn reply_context<'a>(&self, msg: &'a InboundMessage) -> ReplyContext<'a> {
        let receipt = self.receipts.fetch_add(1, Ordering::Relaxed) + 1;
        ReplyContext {
            msg,
            receipt: msg
                .provider_message_id
                .is_none()
                .then(|| format!("receipt-{receipt}")),
        }
    }

    pub fn get_timeline(&self, run_id: &str) -> Result<Option<Timeline>, OrchestratorError> {
        let Some(shared) = self.store.get(run_id)? else {
            return Ok(None);
        };
        let record = lock_record(&shared)?;
        record.verify()?;
        Ok(Some(Timeline {
            run: RunSnapshot::from(record.run()),
            events: record.events().to_vec(),
        }))
    }

    pub fn status_of(&self, run_id: &str) -> Result<Option<RunStatus>, OrchestratorError> {
        let Some(shared) = self.store.get(run_id)? else {
            return Ok(None);
        };
        let record = lock_record(&shared)?;
        Ok(Some(record.status()))
    }

    /// Execution-side callback: a worker picked the run up.
    ///
    /// Duplicate delivery (run already `Running`) and late delivery (run
    /// already terminal) are no-ops reported as [`ExecutionCondition::Duplicate`].
    pub fn on_execution_started(
        &self,
        run_id: &str,
        worker_id: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let Some(shared) = self.store.get(run_id)? else {
            return Ok(ExecutionOutcome::not_found(run_id));
        };
        let mut record = lock_record(&shared)?;
        let status = record.status();
        match status {
            RunStatus::Dispatching => {}
            RunStatus::Running => {
                return Ok(ExecutionOutcome::unchanged(
                    run_id,
                    status,
                    ExecutionCondition::Duplicate,
                ))
            }
            status if status.is_terminal() => {
                return Ok(ExecutionOutcome::unchanged(
                    run_id,
                    status,
                    ExecutionCondition::Duplicate,
                ))
            }
            _ => {
                log_rejected(run_id, status, RunEventKind::Started, worker_id);
                return Ok(ExecutionOutcome::unchanged(
                    run_id,
                    status,
                    ExecutionCondition::InvalidTransition,
                ));
            }
        }

        let payload = payload_with(&[("workerId", worker_id)]);
        append_or_corrupt(&mut record, RunEventKind::Started, worker_id, payload)?;
        Ok(ExecutionOutcome::applied(run_id, record.status(), Vec::new()))
    }

    /// Execution-side callback: the job finished. Repeated delivery for a
    /// terminal run is a no-op.
    pub fn on_execution_completed(
        &self,
        run_id: &str,
        worker_id: &str,
        success: bool,
        summary: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let Some(shared) = self.store.get(run_id)? else {
            return Ok(ExecutionOutcome::not_found(run_id));
        };
        let mut record = lock_record(&shared)?;
        let status = record.status();
        let kind = if success {
            RunEventKind::Succeeded
        } else {
            RunEventKind::Failed
        };
        if status.is_terminal() {
            return Ok(ExecutionOutcome::unchanged(
                run_id,
                status,
                ExecutionCondition::Duplicate,
            ));
        }
        if status != RunStatus::Running {
            log_rejected(run_id, status, kind, worker_id);
            return Ok(ExecutionOutcome::unchanged(
                run_id,
                status,
                ExecutionCondition::InvalidTransition,
            ));
        }

        let payload = payload_with(&[("workerId", worker_id), ("summary", summary)]);
        let event = append_or_corrupt(&mut record, kind, worker_id, payload)?;
        let run = record.run();
        let body = if success {
            format!("Run {} (`{}`) succeeded: {summary}", run.run_id, run.job_key)
        } else {
            format!("Run {} (`{}`) failed: {summary}", run.run_id, run.job_key)
        };
        let purpose = if success { "succeeded" } else { "failed" };
        let outbound = OutboundMessage::for_run_event(run, &event, purpose, body);
        tracing::info!(
            event = "run.finished",
            run_id,
            worker_id,
            success,
            "run finished"
        );
        Ok(ExecutionOutcome::applied(run_id, run.status, vec![outbound]))
    }

    /// External timeout signal. Terminal runs are reported, not changed.
    pub fn on_timeout(
        &self,
        run_id: &str,
        reason: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        self.terminate(run_id, RunEventKind::TimedOut, ORCHESTRATOR_ACTOR, reason)
    }

    /// Operator cancellation of any non-terminal run.
    pub fn cancel_run(
        &self,
        run_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        self.terminate(run_id, RunEventKind::Canceled, actor, reason)
    }

    /// Times out every non-terminal run created at least `max_age` before
    /// `now`. Returns the outcomes of the runs that were changed.
    pub fn time_out_stale_runs(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionOutcome>, OrchestratorError> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|max_age| now.checked_sub_signed(max_age))
        else {
            return Ok(Vec::new());
        };
        let reason = "run exceeded its maximum age";
        let mut outcomes = Vec::new();
        for run_id in self.store.run_ids()? {
            let Some(shared) = self.store.get(run_id.as_str())? else {
                continue;
            };
            let mut record = lock_record(&shared)?;
            if record.status().is_terminal() || record.run().created_at > cutoff {
                continue;
            }
            outcomes.push(terminate_record(
                &mut record,
                RunEventKind::TimedOut,
                ORCHESTRATOR_ACTOR,
                reason,
            )?);
        }
        Ok(outcomes)
    }

    fn terminate(
        &self,
        run_id: &str,
        kind: RunEventKind,
        actor: &str,
        reason: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let Some(shared) = self.store.get(run_id)? else {
            return Ok(ExecutionOutcome::not_found(run_id));
        };
        let mut record = lock_record(&shared)?;
        terminate_record(&mut record, kind, actor, reason)
    }

    fn create_run(
        &self,
        msg: &InboundMessage,
        job_key: &str,
    ) -> Result<(RunId, OutboundMessage), OrchestratorError> {
        let now = now_utc();
        for _ in 0..RUN_ID_MAX_GENERATION_ATTEMPTS {
            let run_id = generate_run_id(now.timestamp()).map_err(OrchestratorError::IdGeneration)?;
            if self.store.contains(run_id.as_str())? {
                continue;
            }

            let mut record = RunRecord::create(
                NewRun {
                    run_id: run_id.clone(),
                    job_key: job_key.to_string(),
                    requested_by: msg.from.clone(),
                    channel_id: msg.channel.clone(),
                    conversation_id: msg.conversation.clone(),
                },
                now,
            );
            let event = append_or_corrupt(
                &mut record,
                RunEventKind::ApprovalRequested,
                ORCHESTRATOR_ACTOR,
                Map::new(),
            )?;
            let body = format!(
                "Run {run_id} for job `{job_key}` is awaiting approval. Reply `yes {run_id}` to approve or `no {run_id}` to deny."
            );
            let outbound = OutboundMessage::for_run_event(record.run(), &event, "approval", body);

            if self.store.insert(record)? {
                tracing::info!(
                    event = "run.created",
                    run_id = run_id.as_str(),
                    job_key,
                    requested_by = msg.from.as_str(),
                    "run created, awaiting approval"
                );
                return Ok((run_id, outbound));
            }
        }
        Err(OrchestratorError::IdGeneration(format!(
            "no unique run id after {RUN_ID_MAX_GENERATION_ATTEMPTS} attempts"
        )))
    }

    fn decide(
        &self,
        replies: &ReplyContext<'_>,
        run_id: &str,
        intent_type: IntentType,
        outcome: &mut InboundOutcome,
    ) -> Result<(), OrchestratorError> {
        let msg = replies.msg;
        let Some(shared) = self.store.get(run_id)? else {
            outcome.condition = Some(InboundCondition::NotFound {
                run_id: run_id.to_string(),
            });
            return Ok(());
        };
        let mut record = lock_record(&shared)?;
        let status = record.status();
        let decision = if intent_type == IntentType::ApproveRun {
            RunEventKind::Approved
        } else {
            RunEventKind::Denied
        };

        if status != RunStatus::AwaitingApproval {
            log_rejected(run_id, status, decision, &msg.from);
            outcome.outbound.push(replies.about_state(
                "invalid_transition",
                record.last_seq(),
                status,
                format!("Run {run_id} is {status}; it is no longer awaiting approval."),
            ));
            outcome.condition = Some(InboundCondition::InvalidTransition {
                run_id: run_id.to_string(),
                status,
            });
            return Ok(());
        }

        if !self.policy.may_decide(record.run(), &msg.from) {
            tracing::warn!(
                event = "run.rejected",
                run_id,
                sender = msg.from.as_str(),
                "sender is not allowed to decide on this run"
            );
            outcome.outbound.push(replies.about_state(
                "unauthorized",
                record.last_seq(),
                status,
                format!("You are not allowed to approve or deny run {run_id}."),
            ));
            outcome.condition = Some(InboundCondition::Unauthorized {
                run_id: run_id.to_string(),
                sender: msg.from.clone(),
            });
            return Ok(());
        }

        let decided_by = payload_with(&[("decidedBy", msg.from.as_str())]);
        let event = append_or_corrupt(&mut record, decision, &msg.from, decided_by)?;

        if decision == RunEventKind::Denied {
            let run = record.run();
            let body = format!("Run {run_id} (`{}`) was denied by {}.", run.job_key, msg.from);
            outcome.outbound.push(OutboundMessage::for_event_in(
                run,
                &event,
                "denied",
                &msg.channel,
                &msg.conversation,
                body,
            ));
            return Ok(());
        }

        let job_key = record.run().job_key.clone();
        let dispatched = append_or_corrupt(
            &mut record,
            RunEventKind::Dispatched,
            ORCHESTRATOR_ACTOR,
            payload_with(&[("jobKey", job_key.as_str())]),
        )?;
        let run = record.run();
        let body = format!("Run {run_id} (`{job_key}`) approved by {}; dispatching.", msg.from);
        outcome.outbound.push(OutboundMessage::for_event_in(
            run,
            &dispatched,
            "approved",
            &msg.channel,
            &msg.conversation,
            body,
        ));
        outcome.dispatch = Some(ExecutionDispatch::new(run.run_id.clone(), job_key));
        outcome.dispatched_execution = true;
        tracing::info!(
            event = "run.dispatched",
            run_id,
            approved_by = msg.from.as_str(),
            "run approved and dispatched"
        );
        Ok(())
    }

}

/// Addresses the run-less replies to one inbound message. A message without
/// a provider id gets a receipt number, so repeating it yields new keys.
struct ReplyContext<'a> {
    msg: &'a InboundMessage,
    receipt: Option<String>,
}

impl ReplyContext<'_> {
    fn reply(&self, purpose: &str, body: String) -> OutboundMessage {
        let scope: Vec<&str> = self.receipt.as_deref().into_iter().collect();
        OutboundMessage::reply_to(self.msg, purpose, &scope, body)
    }

    /// Reply describing a run's state; keyed by the run's last event too.
    fn about_state(
        &self,
        purpose: &str,
        last_seq: u64,
        status: RunStatus,
        body: String,
    ) -> OutboundMessage {
        let seq = last_seq.to_string();
        let mut scope = vec![seq.as_str(), status.as_str()];
        scope.extend(self.receipt.as_deref());
        OutboundMessage::reply_to(self.msg, purpose, &scope, body)
    }
}

fn guidance(replies: &ReplyContext<'_>, mut outcome: InboundOutcome) -> InboundOutcome {
    outcome.outbound.push(replies.reply(
        "guidance",
        "Commands: `run <job>`, `yes <run>` / `approve <run>`, `no <run>` / `deny <run>`, `status <run>`."
            .to_string(),
    ));
    outcome
}

/// Moves a non-terminal run to `kind` (`TimedOut` or `Canceled`). Terminal
/// runs are reported as an invalid transition and left alone.
fn terminate_record(
    record: &mut RunRecord,
    kind: RunEventKind,
    actor: &str,
    reason: &str,
) -> Result<ExecutionOutcome, OrchestratorError> {
    let owned_run_id = record.run().run_id.to_string();
    let run_id = owned_run_id.as_str();
    let status = record.status();
    if status.is_terminal() {
        log_rejected(run_id, status, kind, actor);
        return Ok(ExecutionOutcome::unchanged(
            run_id,
            status,
            ExecutionCondition::InvalidTransition,
        ));
    }

    let payload = payload_with(&[("reason", reason), ("previousStatus", status.as_str())]);
    let event = append_or_corrupt(record, kind, actor, payload)?;
    let run = record.run();
    let (purpose, body) = match kind {
        RunEventKind::TimedOut => (
            "timed_out",
            format!("Run {} (`{}`) timed out: {reason}", run.run_id, run.job_key),
        ),
        _ => (
            "canceled",
            format!(
                "Run {} (`{}`) was canceled by {actor}: {reason}",
                run.run_id, run.job_key
            ),
        ),
    };
    tracing::info!(event = "run.terminated", run_id, kind = kind.as_str(), "run terminated");
    let outbound = OutboundMessage::for_run_event(run, &event, purpose, body);
    Ok(ExecutionOutcome::applied(run_id, run.status, vec![outbound]))
}

/// Appends an event the caller already checked as legal. A rejection here
/// means the cached status and the transition table disagree.
fn append_or_corrupt(
    record: &mut RunRecord,
    kind: RunEventKind,
    actor: &str,
    payload: Map<String, Value>,
) -> Result<RunEvent, OrchestratorError> {
    let run_id = record.run().run_id.to_string();
    record
        .append(kind, actor, payload, now_utc())
        .cloned()
        .map_err(|rejected| OrchestratorError::Corrupt {
            run_id,
            reason: format!(
                "transition `{}` + `{}` rejected after validation",
                rejected.from, rejected.event
            ),
        })
}

fn payload_with(fields: &[(&str, &str)]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect()
}

fn log_rejected(run_id: &str, status: RunStatus, event: RunEventKind, actor: &str) {
    tracing::warn!(
        event = "run.rejected",
        run_id,
        status = status.as_str(),
        attempted = event.as_str(),
        actor,
        "transition rejected"
    );
}

fn not_found_reply(replies: &ReplyContext<'_>, run_id: &str) -> OutboundMessage {
    replies.reply("not_found", format!("Run {run_id} was not found."))
}

fn render_status(timeline: &Timeline) -> String {
    let run = &timeline.run;
    let mut body = format!(
        "Run {} (`{}`): {}\nRequested by {} at {}",
        run.run_id,
        run.job_key,
        run.status,
        run.requested_by_address,
        run.created_at.to_rfc3339()
    );
    if let Some(last) = timeline.events.last() {
        body.push_str(&format!(
            "\nLast event: {} by {} at {}",
            last.kind,
            last.actor,
            last.at.to_rfc3339()
        ));
    }
    body
}
