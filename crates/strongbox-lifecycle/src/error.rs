//! Rotation error types.

use strongbox_audit::AuditError;
use strongbox_core::{EntryKey, JobId};
use strongbox_crypto::CryptoError;
use strongbox_store::StoreError;
use thiserror::Error;

use crate::state::RotationState;

/// Errors raised by the rotation manager.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: RotationState,
        to: RotationState,
    },

    /// Only one non-terminal job per secret.
    #[error("Secret {secret} already has active rotation {job_id}")]
    AlreadyActive { secret: EntryKey, job_id: JobId },

    #[error("Rotation job {job_id} is {state} and can no longer be cancelled")]
    NotCancellable { job_id: JobId, state: RotationState },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid rotation request: {0}")]
    Invalid(String),

    /// The presented credential is neither current nor an in-grace previous.
    #[error("Credential rejected for {0}")]
    CredentialRejected(EntryKey),

    #[error("Job repository error: {0}")]
    Repository(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RotationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

impl From<std::io::Error> for RotationError {
    fn from(err: std::io::Error) -> Self {
        Self::Repository(err.to_string())
    }
}

impl From<RotationError> for strongbox_core::Error {
    fn from(err: RotationError) -> Self {
        use strongbox_core::Error;
        match err {
            RotationError::Store(e) => e.into(),
            RotationError::Crypto(e) => e.into(),
            RotationError::Audit(e) => e.into(),
            RotationError::NotFound(msg) => Error::NotFound(msg),
            RotationError::Invalid(msg) => Error::Validation(msg),
            RotationError::CredentialRejected(key) => Error::denied(format!("credential rejected for {key}")),
            RotationError::Repository(msg) => Error::Storage(msg),
            RotationError::Json(e) => Error::Storage(e.to_string()),
            other @ (RotationError::AlreadyActive { .. }
            | RotationError::NotCancellable { .. }
            | RotationError::InvalidTransition { .. }) => Error::Validation(other.to_string()),
        }
    }
}

/// Result type for rotation operations.
pub type Result<T> = std::result::Result<T, RotationError>;
