//! Cache error types.

use strongbox_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Tier-2 backend failure. Reads fall through to the store.
    #[error("Shared cache error: {0}")]
    Shared(String),

    #[error("Shared cache call timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The authoritative read failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub fn shared(msg: impl Into<String>) -> Self {
        Self::Shared(msg.into())
    }
}

impl From<CacheError> for strongbox_core::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store(e) => e.into(),
            CacheError::Timeout(msg) => strongbox_core::Error::Timeout(msg),
            other => strongbox_core::Error::storage(other.to_string()),
        }
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
