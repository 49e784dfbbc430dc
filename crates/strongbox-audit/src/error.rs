//! Audit error types.

use std::time::Duration;
use strongbox_core::retry::{RetryableError, TimeoutError};
use thiserror::Error;

/// Errors raised by the audit ledger and its sinks.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Sink I/O failure. Retriable.
    #[error("Audit sink error: {0}")]
    Sink(String),

    #[error("Audit write timed out: {0}")]
    Timeout(String),

    /// The ledger refuses writes after an integrity failure.
    #[error("Audit ledger halted: {0}")]
    Halted(String),

    /// A record does not match the chain.
    #[error("Audit chain broken at record {sequence}: {reason}")]
    Integrity { sequence: u64, reason: String },

    /// The buffered queue is full or closed.
    #[error("Audit queue unavailable: {0}")]
    Queue(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuditError {
    /// Create a sink error.
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Whether backoff-and-retry may help.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Sink(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        Self::Sink(err.to_string())
    }
}

impl RetryableError for AuditError {
    fn is_retryable(&self) -> bool {
        self.is_retriable()
    }
}

impl TimeoutError for AuditError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout(format!("{operation} after {}ms", after.as_millis()))
    }
}

impl From<AuditError> for strongbox_core::Error {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Integrity { sequence, reason } => strongbox_core::Error::Corrupted {
                scope: format!("audit ledger record {sequence}"),
                reason,
            },
            other => strongbox_core::Error::AuditWriteFailure(other.to_string()),
        }
    }
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
