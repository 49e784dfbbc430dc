//! Store error types.

use std::time::Duration;
use strongbox_core::retry::{RetryableError, TimeoutError};
use strongbox_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic-concurrency collision.
    #[error("Version conflict on {resource}: expected {expected}, current {current}")]
    Conflict {
        resource: String,
        expected: u64,
        current: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Tenant is missing, suspended, or being deleted.
    #[error("Tenant unavailable: {0}")]
    TenantUnavailable(String),

    /// The key's persisted chain is corrupt; it accepts no more mutations.
    #[error("Corrupted state in {scope}: {reason}")]
    Corrupted { scope: String, reason: String },

    /// Backend I/O failure. Retriable.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend call timed out: {0}")]
    Timeout(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The commit hook refused the batch (e.g. the audit write failed).
    #[error("Commit rejected: {0}")]
    Rejected(strongbox_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether backoff-and-retry may help.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl RetryableError for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_retriable()
    }
}

impl TimeoutError for StoreError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout(format!("{operation} after {}ms", after.as_millis()))
    }
}

impl From<strongbox_core::error::IdentifierError> for StoreError {
    fn from(err: strongbox_core::error::IdentifierError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<StoreError> for strongbox_core::Error {
    fn from(err: StoreError) -> Self {
        use strongbox_core::Error;
        match err {
            StoreError::Validation(msg) | StoreError::QuotaExceeded(msg) => Error::Validation(msg),
            StoreError::Conflict {
                resource,
                expected,
                current,
            } => Error::Conflict {
                resource,
                expected,
                current,
            },
            StoreError::NotFound(msg) => Error::NotFound(msg),
            StoreError::TenantUnavailable(msg) => Error::denied(msg),
            StoreError::Corrupted { scope, reason } => Error::Corrupted { scope, reason },
            StoreError::Backend(msg) => Error::Storage(msg),
            StoreError::Timeout(msg) => Error::Timeout(msg),
            StoreError::Crypto(e) => e.into(),
            StoreError::Rejected(e) => e,
            StoreError::Json(e) => Error::Storage(e.to_string()),
        }
    }
}

/// Convenience result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
