use crate::orchestration::run_store::{Run, RunEvent};
use crate::shared::compute_idempotency_key;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHANNEL_ID: &str = "chat";
pub const OUTBOUND_MAX_CHARS: usize = 4000;
pub const OUTBOUND_TRUNCATE_KEEP_CHARS: usize = 3900;
pub const OUTBOUND_TRUNCATION_SUFFIX: &str = "\n\n[Response truncated...]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default = "default_channel_id")]
    pub channel: String,
    pub from: String,
    pub conversation: String,
    pub body: String,
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundValidationError {
    #[error("inbound message field `{field}` is required and must be non-empty")]
    MissingField { field: &'static str },
}

impl InboundMessage {
    pub fn new(
        from: impl Into<String>,
        conversation: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            channel: DEFAULT_CHANNEL_ID.to_string(),
            from: from.into(),
            conversation: conversation.into(),
            body: body.into(),
            provider_message_id: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_provider_message_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }

    pub fn validate(&self) -> Result<(), InboundValidationError> {
        for (field, value) in [
            ("channel", &self.channel),
            ("from", &self.from),
            ("conversation", &self.conversation),
            ("body", &self.body),
        ] {
            if value.trim().is_empty() {
                return Err(InboundValidationError::MissingField { field });
            }
        }
        Ok(())
    }
}

fn default_channel_id() -> String {
    DEFAULT_CHANNEL_ID.to_string()
}

/// A reply for some channel conversation. Delivery belongs to an external
/// sender, which may deliver more than once and dedupes on `idempotency_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub body: String,
    pub correlation_id: String,
    pub idempotency_key: String,
    pub channel_id: String,
    pub conversation: String,
}

impl OutboundMessage {
    /// Message triggered by a run event, addressed to the run's own
    /// conversation. Keyed by `(purpose, run id, event seq)`.
    pub fn for_run_event(run: &Run, event: &RunEvent, purpose: &str, body: String) -> Self {
        Self::for_event_in(
            run,
            event,
            purpose,
            &run.channel_id,
            &run.conversation_id,
            body,
        )
    }

    /// Like [`Self::for_run_event`] but addressed to an arbitrary conversation,
    /// e.g. the one an approval arrived from.
    pub fn for_event_in(
        run: &Run,
        event: &RunEvent,
        purpose: &str,
        channel_id: &str,
        conversation: &str,
        body: String,
    ) -> Self {
        let seq = event.seq.to_string();
        Self {
            body: truncate_outbound_text(&body),
            correlation_id: run.run_id.to_string(),
            idempotency_key: compute_idempotency_key(&[
                purpose,
                run.run_id.as_str(),
                &seq,
                channel_id,
                conversation,
            ]),
            channel_id: channel_id.to_string(),
            conversation: conversation.to_string(),
        }
    }

    /// Reply to an inbound message that produced no run event. `scope` adds
    /// whatever else identifies the reply, such as the run state it reports
    /// or the receipt number of a message without a provider id.
    pub fn reply_to(
        inbound: &InboundMessage,
        purpose: &str,
        scope: &[&str],
        body: String,
    ) -> Self {
        let source = inbound
            .provider_message_id
            .as_deref()
            .unwrap_or(inbound.body.as_str());
        let mut parts = vec![
            purpose,
            inbound.channel.as_str(),
            inbound.conversation.as_str(),
            inbound.from.as_str(),
            source,
        ];
        parts.extend_from_slice(scope);
        let idempotency_key = compute_idempotency_key(&parts);
        Self {
            body: truncate_outbound_text(&body),
            correlation_id: inbound
                .provider_message_id
                .clone()
                .unwrap_or_else(|| idempotency_key.clone()),
            idempotency_key,
            channel_id: inbound.channel.clone(),
            conversation: inbound.conversation.clone(),
        }
    }
}

fn truncate_outbound_text(message: &str) -> String {
    if message.chars().count() <= OUTBOUND_MAX_CHARS {
        return message.to_string();
    }

    let mut truncated = String::new();
    truncated.extend(message.chars().take(OUTBOUND_TRUNCATE_KEEP_CHARS));
    truncated.push_str(OUTBOUND_TRUNCATION_SUFFIX);
    truncated
}
