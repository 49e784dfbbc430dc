//! Per-key version chains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongbox_core::config::RetentionConfig;
use strongbox_core::EntryKey;

use crate::error::{Result, StoreError};
use crate::types::Version;

/// The persisted form of one key: its address and retained versions,
/// oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub key: EntryKey,
    pub versions: Vec<Version>,
    /// Highest number issued before the chain last expired. Numbering
    /// continues above it.
    #[serde(default)]
    pub expired_through: u64,
}

/// In-memory version chain for one key.
#[derive(Debug, Clone)]
pub struct VersionChain {
    key: EntryKey,
    versions: Vec<Version>,
    expired_through: u64,
    quarantine: Option<String>,
}

impl VersionChain {
    /// Empty chain for a key that has never been written.
    pub fn empty(key: EntryKey) -> Self {
        Self {
            key,
            versions: Vec::new(),
            expired_through: 0,
            quarantine: None,
        }
    }

    /// Rebuild a chain from its persisted record. A chain that is not
    /// contiguous comes back quarantined rather than repaired.
    pub fn from_record(record: ChainRecord) -> Self {
        let quarantine = check_contiguous(&record.versions, record.expired_through).err();
        Self {
            key: record.key,
            versions: record.versions,
            expired_through: record.expired_through,
            quarantine,
        }
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn to_record(&self) -> ChainRecord {
        ChainRecord {
            key: self.key.clone(),
            versions: self.versions.clone(),
            expired_through: self.expired_through,
        }
    }

    /// Record that would result from appending `version`.
    pub fn record_with(&self, version: &Version) -> ChainRecord {
        let mut versions = self.versions.clone();
        versions.push(version.clone());
        ChainRecord {
            key: self.key.clone(),
            versions,
            expired_through: self.expired_through,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// No version has ever been issued for this key.
    pub fn never_written(&self) -> bool {
        self.versions.is_empty() && self.expired_through == 0
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Reason the chain is quarantined, if it is.
    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantine.as_deref()
    }

    /// Fail if the chain accepts no mutations.
    pub fn ensure_writable(&self) -> Result<()> {
        match &self.quarantine {
            Some(reason) => Err(StoreError::Corrupted {
                scope: self.key.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Number of the newest version, 0 if none.
    pub fn current_number(&self) -> u64 {
        self.versions.last().map(|v| v.number).unwrap_or(0)
    }

    /// Next number to issue. Never reuses a number from an expired
    /// history.
    pub fn next_number(&self) -> u64 {
        self.current_number().max(self.expired_through) + 1
    }

    /// Newest version, including tombstones.
    pub fn head(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// Newest version if it is not a tombstone.
    pub fn live(&self) -> Option<&Version> {
        self.head().filter(|v| !v.value.is_tombstone())
    }

    /// Exact version lookup.
    pub fn get(&self, number: u64) -> Option<&Version> {
        self.versions
            .binary_search_by_key(&number, |v| v.number)
            .ok()
            .map(|idx| &self.versions[idx])
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Check `expected` against the current version number.
    pub fn check_expected(&self, expected: Option<u64>) -> Result<()> {
        match expected {
            Some(expected) if expected != self.current_number() => Err(StoreError::Conflict {
                resource: self.key.to_string(),
                expected,
                current: self.current_number(),
            }),
            _ => Ok(()),
        }
    }

    /// Append the next version. The number must continue the chain.
    pub fn append(&mut self, version: Version) -> Result<()> {
        self.ensure_writable()?;
        if version.number != self.next_number() {
            return Err(StoreError::Corrupted {
                scope: self.key.to_string(),
                reason: format!(
                    "attempted to append v{} after v{}",
                    version.number,
                    self.current_number()
                ),
            });
        }
        self.versions.push(version);
        Ok(())
    }

    /// Versions that retention would remove, oldest first.
    ///
    /// The newest version is never removed and at least `min_versions` are
    /// kept. Without `max_age_days` everything beyond `min_versions` goes;
    /// with it, only versions older than the cutoff. A chain whose head is a
    /// tombstone older than the cutoff expires entirely.
    pub fn retention_plan(&self, policy: &RetentionConfig, now: DateTime<Utc>) -> RetentionPlan {
        if self.versions.is_empty() || self.quarantine.is_some() {
            return RetentionPlan::Keep;
        }

        let cutoff = policy
            .max_age_days
            .map(|days| now - chrono::Duration::days(i64::from(days)));

        if let (Some(cutoff), Some(head)) = (cutoff, self.head()) {
            if head.value.is_tombstone() && head.created_at < cutoff {
                return RetentionPlan::Expire;
            }
        }

        let keep_at_least = policy.min_versions.max(1);
        let removable = self.versions.len().saturating_sub(keep_at_least);
        let count = self.versions[..removable]
            .iter()
            .take_while(|v| cutoff.map_or(true, |c| v.created_at < c))
            .count();

        if count == 0 {
            RetentionPlan::Keep
        } else {
            RetentionPlan::Prune(count)
        }
    }

    /// Drop the `count` oldest versions.
    pub fn prune(&mut self, count: usize) {
        let count = count.min(self.versions.len().saturating_sub(1));
        self.versions.drain(..count);
    }

    /// Record after pruning `count` versions.
    pub fn record_pruned(&self, count: usize) -> ChainRecord {
        let count = count.min(self.versions.len().saturating_sub(1));
        ChainRecord {
            key: self.key.clone(),
            versions: self.versions[count..].to_vec(),
            expired_through: self.expired_through,
        }
    }

    /// Drop every version, remembering the highest number issued.
    pub fn expire(&mut self) {
        self.expired_through = self.next_number() - 1;
        self.versions.clear();
    }

    /// Record after [`expire`](Self::expire).
    pub fn record_expired(&self) -> ChainRecord {
        ChainRecord {
            key: self.key.clone(),
            versions: Vec::new(),
            expired_through: self.next_number() - 1,
        }
    }
}

/// What retention does to one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPlan {
    Keep,
    Prune(usize),
    Expire,
}

/// Versions must be numbered above the expiry floor and increase by
/// exactly one.
fn check_contiguous(versions: &[Version], floor: u64) -> std::result::Result<(), String> {
    let Some(first) = versions.first() else {
        return Ok(());
    };
    if first.number <= floor {
        return Err(format!("v{} is not above expired v{floor}", first.number));
    }
    for pair in versions.windows(2) {
        if pair[1].number != pair[0].number + 1 {
            return Err(format!(
                "version chain gap between v{} and v{}",
                pair[0].number, pair[1].number
            ));
        }
    }
    Ok(())
}
