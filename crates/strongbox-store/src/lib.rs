//! # strongbox-store
//!
//! Versioned configuration store for Strongbox.
//!
//! Every key holds an append-only chain of numbered versions. Writes are
//! guarded by optimistic concurrency, secrets are sealed through the
//! envelope engine before they reach a backend, and multi-key transactions
//! commit all-or-nothing.

pub mod backend;
pub mod chain;
pub mod diff;
pub mod error;
pub mod events;
pub mod store;
pub mod tenants;
pub mod transaction;
pub mod types;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use chain::ChainRecord;
pub use diff::{Patch, PatchOp};
pub use error::{Result, StoreError};
pub use events::{CommitBatch, CommitHook, InvalidationBus, InvalidationEvent, NoopHook, PendingWrite, WriteKind};
pub use store::{RetentionReport, StoreBuilder, VersionedStore};
pub use tenants::TenantRecord;
pub use transaction::{StagedOp, Transaction};
pub use types::{EntryValue, ValueKind, Version, VersionInfo, VersionValue, VersionedEntry, WriteOptions};
