//! Structured logging with correlation tracking.
//!
//! Log records are single-line JSON objects with stable field names
//! (`timestamp`, `level`, `message`, `component`, `correlation_id`) plus
//! caller-supplied fields. Records are emitted through `tracing` at the
//! matching level so the host application's subscriber owns the transport;
//! [`init_subscriber`] installs a plain stdout subscriber for standalone use.
//!
//! [`Logger::span`] produces a scoped timer that logs `span_start` on
//! creation and `span_end` (or `span_failed`) with the elapsed duration.

mod correlation;

pub use correlation::{
    correlation_scope, current_correlation_id, new_correlation_id, with_correlation,
};

use std::fmt::Display;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Log levels understood by the record emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Install a stdout `tracing` subscriber honouring `RUST_LOG`.
///
/// The core never calls this itself; embedding layers that do not configure
/// their own subscriber can.
pub fn init_subscriber() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Component-scoped structured logger
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    component: &'static str,
}

impl Logger {
    /// Create a logger for a named component
    pub const fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// Build the JSON record for a log call.
    ///
    /// Kept separate from emission so tests can assert on the exact field
    /// layout without installing a subscriber. The correlation field is
    /// omitted entirely when no scope is active.
    pub fn build_record(
        &self,
        level: LogLevel,
        message: &str,
        fields: &[(&str, Value)],
    ) -> Value {
        let mut record = Map::new();
        record.insert(
            "timestamp".to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        record.insert("level".to_string(), Value::from(level.as_str()));
        record.insert("message".to_string(), Value::from(message));
        record.insert("component".to_string(), Value::from(self.component));
        if let Some(id) = current_correlation_id() {
            record.insert("correlation_id".to_string(), Value::from(id));
        }
        for (key, value) in fields {
            record.insert((*key).to_string(), value.clone());
        }
        Value::Object(record)
    }

    /// Emit a structured record at the given level
    pub fn log(&self, level: LogLevel, message: &str, fields: &[(&str, Value)]) {
        let line = self.build_record(level, message, fields).to_string();
        match level {
            LogLevel::Debug => tracing::debug!(target: "engram", "{line}"),
            LogLevel::Info => tracing::info!(target: "engram", "{line}"),
            LogLevel::Warn => tracing::warn!(target: "engram", "{line}"),
            LogLevel::Error => tracing::error!(target: "engram", "{line}"),
        }
    }

    /// Emit at DEBUG
    pub fn debug(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Debug, message, fields);
    }

    /// Emit at INFO
    pub fn info(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Info, message, fields);
    }

    /// Emit at WARN
    pub fn warn(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Warn, message, fields);
    }

    /// Emit at ERROR
    pub fn error(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Error, message, fields);
    }

    /// Start a timed span; logs `span_start` immediately
    pub fn span(&self, name: impl Into<String>, fields: Vec<(&'static str, Value)>) -> SpanTimer {
        let name = name.into();
        let mut start_fields = fields.clone();
        start_fields.push(("event", Value::from("span_start")));
        start_fields.push(("span", Value::from(name.clone())));
        self.log(LogLevel::Info, &format!("span started: {name}"), &start_fields);

        SpanTimer {
            logger: *self,
            name,
            fields,
            started: Instant::now(),
            finished: false,
        }
    }
}

/// Scoped span timer created by [`Logger::span`].
///
/// Dropping an unfinished timer logs a normal `span_end`; call [`fail`] to
/// record a failure instead.
///
/// [`fail`]: SpanTimer::fail
#[must_use = "a span timer logs its end when completed or dropped"]
pub struct SpanTimer {
    logger: Logger,
    name: String,
    fields: Vec<(&'static str, Value)>,
    started: Instant,
    finished: bool,
}

impl SpanTimer {
    /// Elapsed time since the span started
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn emit(&mut self, level: LogLevel, event: &str, extra: Option<(&'static str, Value)>) {
        self.finished = true;
        let mut fields = self.fields.clone();
        fields.push(("event", Value::from(event)));
        fields.push(("span", Value::from(self.name.clone())));
        fields.push(("duration_ms", Value::from(self.elapsed_ms())));
        if let Some(pair) = extra {
            fields.push(pair);
        }
        let message = format!("span {event}: {}", self.name);
        self.logger.log(level, &message, &fields);
    }

    /// Complete the span successfully
    pub fn finish(mut self) {
        self.emit(LogLevel::Info, "span_end", None);
    }

    /// Complete the span as failed, recording the error
    pub fn fail(mut self, error: &impl Display) {
        self.emit(
            LogLevel::Error,
            "span_failed",
            Some(("error", Value::from(error.to_string()))),
        );
    }
}

impl Drop for SpanTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.emit(LogLevel::Info, "span_end", None);
        }
    }
}
