//! Version and value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strongbox_core::{ActorId, EntryKey, SecretBytes};
use strongbox_crypto::EncryptedValue;

/// A value supplied by, or returned to, a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryValue {
    /// Plain structured configuration.
    Plain(Value),

    /// Secret material. Encrypted before it reaches storage.
    Secret(SecretBytes),
}

impl EntryValue {
    /// Create a secret value from a string.
    pub fn secret(value: impl Into<String>) -> Self {
        Self::Secret(SecretBytes::new(value.into().into_bytes()))
    }

    /// Size used for quota checks.
    pub fn size(&self) -> usize {
        match self {
            Self::Plain(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0),
            Self::Secret(s) => s.len(),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }
}

/// A persisted version payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum VersionValue {
    Plain(Value),
    Secret(EncryptedValue),
    Tombstone,
}

impl VersionValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Plain(_) => ValueKind::Plain,
            Self::Secret(_) => ValueKind::Secret,
            Self::Tombstone => ValueKind::Tombstone,
        }
    }
}

/// Kind of a stored version, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Plain,
    Secret,
    Tombstone,
}

/// One immutable version of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub number: u64,
    pub value: VersionValue,
    pub created_at: DateTime<Utc>,
    pub created_by: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Version {
    /// Metadata-only view.
    pub fn info(&self) -> VersionInfo {
        VersionInfo {
            number: self.number,
            kind: self.value.kind(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            description: self.description.clone(),
        }
    }
}

/// Version metadata, safe to list and log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub number: u64,
    pub kind: ValueKind,
    pub created_at: DateTime<Utc>,
    pub created_by: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A stored version together with the key it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub key: EntryKey,
    pub version: Version,
}

/// Per-write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Reject the write unless the current version equals this. `Some(0)`
    /// means "the key must not exist yet".
    pub expected_version: Option<u64>,

    /// Change note stored with the version.
    pub description: Option<String>,
}

impl WriteOptions {
    pub fn expecting(version: u64) -> Self {
        Self {
            expected_version: Some(version),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
