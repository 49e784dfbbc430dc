//! Error types for Strongbox core.

use std::path::PathBuf;
use thiserror::Error;

/// Core result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error taxonomy.
///
/// Component crates keep their own error enums and convert into this one at
/// the façade boundary. Only [`Error::Storage`] and [`Error::Timeout`] are
/// retriable; everything else surfaces to the caller as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input. Never retriable.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic-concurrency collision. The caller may retry after
    /// re-reading current state.
    #[error("Version conflict on {resource}: expected {expected}, current {current}")]
    Conflict {
        resource: String,
        expected: u64,
        current: u64,
    },

    /// The authorization collaborator said no, or a credential is not valid.
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Wrap, unwrap, encrypt or decrypt failure.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Backend I/O failure or corrupted persisted state.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Persisted state is corrupt for the named scope; mutation is halted.
    #[error("Corrupted state in {scope}: {reason}")]
    Corrupted { scope: String, reason: String },

    /// Rotation state machine aborted. The previous secret is still valid.
    #[error("Rotation failure: {0}")]
    RotationFailure(String),

    /// Audit ledger write failed on a fail-closed path.
    #[error("Audit write failure: {0}")]
    AuditWriteFailure(String),

    /// Resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external call exceeded its time budget.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an authorization-denied error.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::AuthorizationDenied(reason.into())
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Timeout(_))
    }

    /// Short machine-readable kind, used in audit details and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict { .. } => "conflict",
            Self::AuthorizationDenied(_) => "authorization_denied",
            Self::Crypto(_) => "crypto",
            Self::Storage(_) => "storage",
            Self::Corrupted { .. } => "corrupted",
            Self::RotationFailure(_) => "rotation_failure",
            Self::AuditWriteFailure(_) => "audit_write_failure",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON5 parse error: {0}")]
    Json5(String),
}

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} exceeds maximum length of {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} contains invalid characters (allowed: alphanumeric, underscore, hyphen): {value}")]
    InvalidChars { kind: &'static str, value: String },

    #[error("namespace depth {depth} exceeds maximum of {max}")]
    TooDeep { depth: usize, max: usize },

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
}

impl From<IdentifierError> for Error {
    fn from(e: IdentifierError) -> Self {
        Self::Validation(e.to_string())
    }
}
