//! Transaction handles.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use strongbox_core::{ActorId, EntryKey};

use crate::types::EntryValue;

/// A staged operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    Set(EntryValue),
    Delete,
}

/// A staged write with its optimistic-concurrency expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub op: StagedOp,
    pub expected_version: Option<u64>,
    pub description: Option<String>,
}

/// Accumulates writes until committed or aborted. Nothing staged is
/// visible or persisted before commit.
///
/// Staging the same key twice replaces the earlier write.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    actor: ActorId,
    started_at: DateTime<Utc>,
    staged: BTreeMap<EntryKey, StagedWrite>,
}

impl Transaction {
    pub(crate) fn new(actor: ActorId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: strongbox_core::id::prefixed("tx"),
            actor,
            started_at,
            staged: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Stage a value write.
    pub fn stage_set(&mut self, key: EntryKey, value: EntryValue, expected_version: Option<u64>) -> &mut Self {
        self.staged.insert(
            key,
            StagedWrite {
                op: StagedOp::Set(value),
                expected_version,
                description: None,
            },
        );
        self
    }

    /// Stage a deletion (tombstone).
    pub fn stage_delete(&mut self, key: EntryKey, expected_version: Option<u64>) -> &mut Self {
        self.staged.insert(
            key,
            StagedWrite {
                op: StagedOp::Delete,
                expected_version,
                description: None,
            },
        );
        self
    }

    /// Attach a change note to an already staged key.
    pub fn describe(&mut self, key: &EntryKey, description: impl Into<String>) -> &mut Self {
        if let Some(write) = self.staged.get_mut(key) {
            write.description = Some(description.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Keys in lock order.
    pub fn keys(&self) -> impl Iterator<Item = &EntryKey> {
        self.staged.keys()
    }

    pub(crate) fn into_writes(self) -> (String, ActorId, BTreeMap<EntryKey, StagedWrite>) {
        (self.id, self.actor, self.staged)
    }
}
