//! Tenant records.

use super::identifiers::{KekId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provisioned tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,

    /// Reference to the tenant's root key in the key service. Never key material.
    pub root_key_ref: KekId,

    #[serde(default)]
    pub quotas: TenantQuotas,

    #[serde(default)]
    pub status: TenantStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create an active tenant.
    pub fn new(id: TenantId, root_key_ref: KekId, quotas: TenantQuotas, now: DateTime<Utc>) -> Self {
        Self {
            id,
            root_key_ref,
            quotas,
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the tenant accepts writes.
    pub fn is_writable(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Per-tenant resource limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuotas {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_keys: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_versions_per_key: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value_bytes: Option<usize>,
}

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Active,
    Suspended,
    PendingDeletion,
}
