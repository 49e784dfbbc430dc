//! Mutation events and the commit hook.
//!
//! The store only publishes; the cache subscribes. Nothing flows back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongbox_core::{ActorId, EntryKey, TenantId};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::StoreError;

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// A key moved to `version`.
    Key {
        key: EntryKey,
        version: u64,
        at: DateTime<Utc>,
    },

    /// Old versions of a key were removed by retention, or the key expired.
    Pruned { key: EntryKey, at: DateTime<Utc> },

    /// Everything belonging to a tenant is gone.
    Tenant { tenant: TenantId, at: DateTime<Utc> },
}

impl InvalidationEvent {
    pub fn tenant(&self) -> &TenantId {
        match self {
            Self::Key { key, .. } | Self::Pruned { key, .. } => &key.tenant,
            Self::Tenant { tenant, .. } => tenant,
        }
    }
}

/// Broadcast channel for invalidation events.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: InvalidationEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(receivers, "published invalidation event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// How a write changes its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteKind {
    Create,
    Update,
    Delete,
    Rollback { target: u64 },
}

/// One write inside a batch about to be committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub key: EntryKey,
    pub version: u64,
    pub previous: Option<u64>,
    pub kind: WriteKind,
    pub secret: bool,
}

/// A validated batch, after conflict checks and before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    pub actor: ActorId,

    /// Set for multi-key transactions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    pub writes: Vec<PendingWrite>,
}

/// Runs inside the commit, while the affected keys are locked.
///
/// Returning an error from [`before_commit`](CommitHook::before_commit)
/// aborts the batch with nothing persisted.
#[async_trait]
pub trait CommitHook: Send + Sync {
    async fn before_commit(&self, batch: &CommitBatch) -> Result<(), strongbox_core::Error>;

    /// Called when persistence fails after `before_commit` accepted the batch.
    async fn commit_failed(&self, _batch: &CommitBatch, _error: &StoreError) {}
}

/// Hook that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

#[async_trait]
impl CommitHook for NoopHook {
    async fn before_commit(&self, _batch: &CommitBatch) -> Result<(), strongbox_core::Error> {
        Ok(())
    }
}
