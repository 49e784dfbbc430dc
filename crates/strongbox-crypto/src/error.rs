//! Error types for envelope encryption.

use std::time::Duration;
use strongbox_core::retry::{RetryableError, TimeoutError};
use thiserror::Error;

/// Errors that can occur during crypto operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key service could not be reached. Retriable.
    #[error("Key service unavailable: {0}")]
    Unavailable(String),

    /// The key service answered with an error.
    #[error("Key service error: {0}")]
    KeyService(String),

    #[error("Key service call timed out: {0}")]
    Timeout(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag mismatch, wrong key, or malformed input.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Data key {data_key_id} exhausted after {ops} operations")]
    DataKeyExhausted { data_key_id: String, ops: u64 },

    #[error("Key for tenant {0} has been destroyed")]
    KeyDestroyed(String),

    #[error("Master key error: {0}")]
    MasterKey(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Whether a retry may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl RetryableError for CryptoError {
    fn is_retryable(&self) -> bool {
        self.is_retriable()
    }
}

impl TimeoutError for CryptoError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout(format!("{operation} after {}ms", after.as_millis()))
    }
}

impl From<CryptoError> for strongbox_core::Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Timeout(msg) => Self::Timeout(msg),
            CryptoError::InvalidInput(msg) => Self::Validation(msg),
            other => Self::Crypto(other.to_string()),
        }
    }
}

/// Convenience result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
