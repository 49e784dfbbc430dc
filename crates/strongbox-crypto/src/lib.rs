//! Envelope encryption for Strongbox.
//!
//! Values are sealed with AES-256-GCM under a per-value data key; the data
//! key is persisted only in wrapped form, wrapped by a tenant key-encryption
//! key held by a [`KeyService`]. The engine keeps no long-lived key material:
//! a [`DataKey`] zeroes its plaintext when dropped.
//!
//! Operation counters per data key live in a tenant-scoped
//! [`KeyUsageRegistry`] that callers own and pass in.

pub mod cipher;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod kms;
pub mod local;
pub mod types;
pub mod usage;

pub use engine::{DataKey, EnvelopeEngine};
pub use error::{CryptoError, Result};
pub use fallback::FallbackKeyService;
pub use kms::KeyService;
pub use local::{LocalKeyService, MasterKey};
pub use types::{Algorithm, EncryptedValue, WrappedKey};
pub use usage::{KeyUsageRegistry, UsageCounter, UsageRegistries};
