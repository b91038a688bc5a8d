//! Error classification for the memory core.
//!
//! Every fallible operation in the crate returns [`CoreError`], a structured
//! error with a closed set of kinds. Each kind carries a severity and a
//! recommended recovery strategy that the resilience layer keys off.
//! Driver-level errors are wrapped at the component boundary; the original
//! cause is always retained.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::logging::current_correlation_id;

/// Error severity levels for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Caller mistake; no operator action needed
    Low,
    /// Expected business failure
    Medium,
    /// Dependency or infrastructure failure
    High,
    /// Invariant breach; page someone
    Critical,
}

/// Recommended recovery strategy for an error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Transient; retry with backoff
    Retry,
    /// Shield the dependency behind a breaker
    CircuitBreaker,
    /// Serve a degraded alternative
    Fallback,
    /// Surface to the caller unchanged
    Ignore,
    /// Stop and alert
    Escalate,
}

/// Closed set of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-supplied value violates a stated precondition
    Validation,
    /// Lookup of a non-existent key or id
    NotFound,
    /// Attempt to create an already-existing entity
    Conflict,
    /// Dependency signals throttling
    RateLimit,
    /// Dependency unreachable or errored
    ExternalService,
    /// Relational driver reports a non-transient error
    Database,
    /// Transport failure
    Network,
    /// Invariant breach inside the core
    System,
}

impl ErrorKind {
    /// Severity associated with this kind
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Low,
            ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::RateLimit => Severity::Medium,
            ErrorKind::ExternalService | ErrorKind::Database | ErrorKind::Network => Severity::High,
            ErrorKind::System => Severity::Critical,
        }
    }

    /// Recommended recovery strategy for this kind
    pub fn recovery(&self) -> RecoveryStrategy {
        match self {
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict => {
                RecoveryStrategy::Ignore
            }
            ErrorKind::RateLimit | ErrorKind::Database | ErrorKind::Network => {
                RecoveryStrategy::Retry
            }
            ErrorKind::ExternalService => RecoveryStrategy::CircuitBreaker,
            ErrorKind::System => RecoveryStrategy::Escalate,
        }
    }

    /// Default machine code for this kind
    pub fn default_code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ExternalService => "EXTERNAL_SERVICE_ERROR",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::System => "SYSTEM_ERROR",
        }
    }

    /// User-facing message derived from the kind; internal messages are never
    /// shown to callers.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "The provided data is invalid.",
            ErrorKind::NotFound => "The requested resource was not found.",
            ErrorKind::Conflict => "A conflict occurred with existing data.",
            ErrorKind::RateLimit => "Too many requests. Please wait before trying again.",
            ErrorKind::ExternalService => "Service temporarily unavailable.",
            ErrorKind::Database => "A storage error occurred. Please try again.",
            ErrorKind::Network => "A network error occurred. Please try again.",
            ErrorKind::System => "An internal error occurred.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Database => "database",
            ErrorKind::Network => "network",
            ErrorKind::System => "system",
        };
        f.write_str(name)
    }
}

/// Structured error carried across every component boundary.
///
/// The underlying cause, when present, is reference-counted so one dispatcher
/// failure can be fanned out to every affected request future without losing
/// the source chain.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct CoreError {
    /// Error kind from the closed taxonomy
    pub kind: ErrorKind,

    /// Short machine code, e.g. `CIRCUIT_OPEN`
    pub code: String,

    /// Internal message; never shown to callers
    pub message: String,

    /// Correlation id active when the error was constructed
    pub correlation_id: Option<String>,

    /// Arbitrary technical details for the log stream
    pub details: HashMap<String, Value>,

    /// Wrapped underlying cause
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// Create a new error of the given kind with the kind's default code
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_string(),
            message: message.into(),
            correlation_id: current_correlation_id(),
            details: HashMap::new(),
            source: None,
        }
    }

    /// Caller input violated a precondition
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Lookup target does not exist
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Entity already exists
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Dependency throttled the request
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// Dependency unreachable or errored
    pub fn external_service(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, message)
    }

    /// Relational store failure
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// Transport failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Invariant breach inside the core
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    /// Replace the machine code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Attach a technical detail
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach the underlying cause
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Severity of this error's kind
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Recommended recovery strategy for this error's kind
    pub fn recovery(&self) -> RecoveryStrategy {
        self.kind.recovery()
    }

    /// Whether the recommended recovery is a retry
    pub fn is_retryable(&self) -> bool {
        self.recovery() == RecoveryStrategy::Retry
    }

    /// User-facing message derived from the kind
    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    /// Structured representation for the log stream
    pub fn to_log_value(&self) -> Value {
        serde_json::json!({
            "kind": self.kind,
            "code": self.code,
            "message": self.message,
            "severity": self.severity(),
            "recovery": self.recovery(),
            "correlation_id": self.correlation_id,
            "details": self.details,
            "cause": self.source.as_ref().map(|s| s.to_string()),
        })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                CoreError::not_found("row not found").with_source(err)
            }
            sqlx::Error::PoolTimedOut => CoreError::external_service("relational pool timed out")
                .with_code("POOL_TIMEOUT")
                .with_source(err),
            sqlx::Error::PoolClosed => CoreError::external_service("relational pool closed")
                .with_code("POOL_CLOSED")
                .with_source(err),
            sqlx::Error::Io(_) => CoreError::network("relational transport failure").with_source(err),
            _ => CoreError::database(err.to_string()).with_source(err),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            CoreError::external_service(err.to_string())
                .with_code("KEY_VALUE_UNREACHABLE")
                .with_source(err)
        } else if err.is_timeout() {
            CoreError::network(err.to_string())
                .with_code("KEY_VALUE_TIMEOUT")
                .with_source(err)
        } else {
            CoreError::network(err.to_string()).with_source(err)
        }
    }
}

impl From<neo4rs::Error> for CoreError {
    fn from(err: neo4rs::Error) -> Self {
        CoreError::external_service(err.to_string())
            .with_code("GRAPH_ERROR")
            .with_source(err)
    }
}

/// Result type used throughout the core
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification_table() {
        assert_eq!(ErrorKind::Validation.severity(), Severity::Low);
        assert_eq!(ErrorKind::Validation.recovery(), RecoveryStrategy::Ignore);

        assert_eq!(ErrorKind::RateLimit.severity(), Severity::Medium);
        assert_eq!(ErrorKind::RateLimit.recovery(), RecoveryStrategy::Retry);

        assert_eq!(
            ErrorKind::ExternalService.recovery(),
            RecoveryStrategy::CircuitBreaker
        );

        assert_eq!(ErrorKind::Database.recovery(), RecoveryStrategy::Retry);
        assert_eq!(ErrorKind::Network.severity(), Severity::High);

        assert_eq!(ErrorKind::System.severity(), Severity::Critical);
        assert_eq!(ErrorKind::System.recovery(), RecoveryStrategy::Escalate);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(CoreError::network("boom").is_retryable());
        assert!(CoreError::rate_limit("slow down").is_retryable());
        assert!(CoreError::database("bad row").is_retryable());
        assert!(!CoreError::validation("bad input").is_retryable());
        assert!(!CoreError::external_service("down").is_retryable());
    }

    #[test]
    fn test_user_message_is_derived() {
        let err = CoreError::database("connection reset by postgres backend 4312");
        assert_eq!(err.user_message(), "A storage error occurred. Please try again.");
        assert!(!err.user_message().contains("4312"));
    }

    #[test]
    fn test_source_survives_clone() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = CoreError::network("transport failure").with_source(io);
        let cloned = err.clone();

        let source = std::error::Error::source(&cloned).expect("source retained");
        assert!(source.to_string().contains("reset"));
    }

    #[test]
    fn test_details_round_trip() {
        let err = CoreError::rate_limit("throttled")
            .with_code("RETRY_EXHAUSTED")
            .with_detail("attempts", 3)
            .with_detail("endpoint", "memories");

        assert_eq!(err.code, "RETRY_EXHAUSTED");
        assert_eq!(err.details.get("attempts"), Some(&Value::from(3)));
        let logged = err.to_log_value();
        assert_eq!(logged["code"], "RETRY_EXHAUSTED");
        assert_eq!(logged["details"]["endpoint"], "memories");
    }
}
