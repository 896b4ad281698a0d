//! Tracing layer that re-emits log records on the event bus.

use std::cell::Cell;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::bus::{EventBus, Signal};

/// Sender name used for `logrecord-emitted` events.
pub const LOG_SENDER: &str = "logging";

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
            fields: Vec::new(),
        }
    }

    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if !field.name().starts_with("log.") {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else if !field.name().starts_with("log.") {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Forwards every tracing event (and bridged `log` record) to the bus as
/// `logrecord-emitted`.
pub struct BusLogLayer {
    bus: Arc<EventBus>,
}

impl BusLogLayer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

impl<S> Layer<S> for BusLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // A listener that logs must not feed back into the bus
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }

        // Records bridged from `log` carry their real target in `log.*` fields
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());

        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);
        let message = visitor.finish();

        let record = LogRecord {
            level: level_name(metadata.level()).to_string(),
            target: metadata.target().to_string(),
            message: if message.is_empty() {
                metadata.name().to_string()
            } else {
                message
            },
            timestamp: Utc::now(),
        };

        if let Ok(value) = serde_json::to_value(&record) {
            let mut payload = serde_json::Map::new();
            payload.insert("record".to_string(), value);
            self.bus.send(Signal::LogRecordEmitted, LOG_SENDER, payload);
        }

        FORWARDING.with(|f| f.set(false));
    }
}
