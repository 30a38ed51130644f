use crate::orchestration::OutboundMessage;
use std::io::{self, Write};
use std::sync::Mutex;

/// Delivery side of outbound replies. Implementations may deliver a message
/// more than once; receivers dedupe on `idempotency_key`.
pub trait OutboundSink: Send + Sync {
    fn deliver(&self, message: &OutboundMessage) -> io::Result<()>;
}

/// Delivers every message, logging failures instead of stopping at the first.
pub(crate) fn deliver_all(sink: &dyn OutboundSink, messages: &[OutboundMessage]) {
    for message in messages {
        if let Err(err) = sink.deliver(message) {
            tracing::error!(
                event = "outbound.delivery_failed",
                correlation_id = %message.correlation_id,
                idempotency_key = %message.idempotency_key,
                error = %err,
                "outbound delivery failed"
            );
        }
    }
}

/// Keeps delivered messages in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        match self.messages.lock() {
            Ok(mut messages) => std::mem::take(&mut *messages),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl OutboundSink for CollectingSink {
    fn deliver(&self, message: &OutboundMessage) -> io::Result<()> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| io::Error::other("collecting sink lock poisoned"))?;
        messages.push(message.clone());
        Ok(())
    }
}

/// Writes one JSON document per message to the wrapped writer.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> OutboundSink for JsonLinesSink<W> {
    fn deliver(&self, message: &OutboundMessage) -> io::Result<()> {
        let encoded = serde_json::to_string(message).map_err(io::Error::other)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("outbound writer lock poisoned"))?;
        writeln!(writer, "{encoded}")?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> OutboundMessage {
        OutboundMessage {
            body: "Run run-1 succeeded".to_string(),
            correlation_id: "run-1".to_string(),
            idempotency_key: key.to_string(),
            channel_id: "chat".to_string(),
            conversation: "ops".to_string(),
        }
    }

    #[test]
    fn json_lines_sink_writes_one_document_per_message() {
        let sink = JsonLinesSink::new(Vec::new());
        deliver_all(&sink, &[message("k1"), message("k2")]);
        let written = String::from_utf8(sink.into_inner()).expect("utf8");
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: OutboundMessage = serde_json::from_str(lines[1]).expect("decode line");
        assert_eq!(decoded.idempotency_key, "k2");
        assert!(lines[0].contains("\"idempotencyKey\":\"k1\""));
    }

    #[test]
    fn collecting_sink_take_drains() {
        let sink = CollectingSink::new();
        sink.deliver(&message("k1")).expect("deliver");
        assert_eq!(sink.take().len(), 1);
        assert!(sink.messages().is_empty());
    }
}
