//! Cache keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use strongbox_core::{EntryKey, TenantId};

/// Which version of a key an entry caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionTag {
    /// The newest live version. Invalidated by every write.
    Latest,

    /// A specific version. Immutable once written.
    Exact(u64),
}

impl VersionTag {
    pub fn from_request(version: Option<u64>) -> Self {
        version.map_or(Self::Latest, Self::Exact)
    }

    pub fn as_request(self) -> Option<u64> {
        match self {
            Self::Latest => None,
            Self::Exact(n) => Some(n),
        }
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(n) => write!(f, "v{n}"),
        }
    }
}

/// `(tenant, namespace, key, version tag)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub entry: EntryKey,
    pub tag: VersionTag,
}

impl CacheKey {
    pub fn new(entry: EntryKey, tag: VersionTag) -> Self {
        Self { entry, tag }
    }

    pub fn latest(entry: EntryKey) -> Self {
        Self::new(entry, VersionTag::Latest)
    }

    pub fn tenant(&self) -> &TenantId {
        &self.entry.tenant
    }

    /// Key under which the shared tier stores this entry.
    pub fn shared_key(&self) -> String {
        format!("{}@{}", self.entry, self.tag)
    }

    /// Shared-tier prefix covering every tag of `entry`.
    pub fn entry_prefix(entry: &EntryKey) -> String {
        format!("{entry}@")
    }

    /// Shared-tier prefix covering every entry of `tenant`.
    pub fn tenant_prefix(tenant: &TenantId) -> String {
        format!("{tenant}:")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entry, self.tag)
    }
}
