//! Tenant registry: provisioning, quotas, status, retention policies.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strongbox_core::config::RetentionConfig;
use strongbox_core::{Namespace, Tenant, TenantId, TenantQuotas, TenantStatus};

use crate::error::{Result, StoreError};

/// Persisted tenant state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant: Tenant,

    /// Retention policies by namespace. The closest ancestor applies.
    #[serde(default)]
    pub retention: BTreeMap<Namespace, RetentionConfig>,
}

impl TenantRecord {
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            retention: BTreeMap::new(),
        }
    }

    /// Retention policy for `namespace`, walking up to the root.
    pub fn retention_for(&self, namespace: &Namespace) -> Option<&RetentionConfig> {
        let mut current = Some(namespace.clone());
        while let Some(ns) = current {
            if let Some(policy) = self.retention.get(&ns) {
                return Some(policy);
            }
            current = ns.parent();
        }
        None
    }
}

/// In-memory view of all tenants. Persistence is the store's job.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: DashMap<TenantId, TenantRecord>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted records.
    pub fn load(records: Vec<TenantRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.tenants.insert(record.tenant.id.clone(), record);
        }
        registry
    }

    pub fn get(&self, id: &TenantId) -> Option<TenantRecord> {
        self.tenants.get(id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<Tenant> {
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|r| r.tenant.clone()).collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    /// Tenant record if the tenant accepts writes.
    pub fn writable(&self, id: &TenantId) -> Result<TenantRecord> {
        let record = self
            .get(id)
            .ok_or_else(|| StoreError::TenantUnavailable(format!("tenant {id} is not provisioned")))?;
        if !record.tenant.is_writable() {
            return Err(StoreError::TenantUnavailable(format!(
                "tenant {id} is {:?}",
                record.tenant.status
            )));
        }
        Ok(record)
    }

    /// Tenant record if the tenant may be read.
    pub fn readable(&self, id: &TenantId) -> Result<TenantRecord> {
        let record = self
            .get(id)
            .ok_or_else(|| StoreError::TenantUnavailable(format!("tenant {id} is not provisioned")))?;
        if record.tenant.status == TenantStatus::PendingDeletion {
            return Err(StoreError::TenantUnavailable(format!("tenant {id} is being deleted")));
        }
        Ok(record)
    }

    /// Build a record for a new tenant. Fails if it already exists.
    pub fn prepare_new(&self, tenant: Tenant) -> Result<TenantRecord> {
        if self.tenants.contains_key(&tenant.id) {
            return Err(StoreError::validation(format!(
                "tenant {} already exists",
                tenant.id
            )));
        }
        Ok(TenantRecord::new(tenant))
    }

    /// Updated copy of a record with new quotas.
    pub fn with_quotas(&self, id: &TenantId, quotas: TenantQuotas, now: DateTime<Utc>) -> Result<TenantRecord> {
        let mut record = self.existing(id)?;
        record.tenant.quotas = quotas;
        record.tenant.updated_at = now;
        Ok(record)
    }

    /// Updated copy of a record with a new status.
    pub fn with_status(&self, id: &TenantId, status: TenantStatus, now: DateTime<Utc>) -> Result<TenantRecord> {
        let mut record = self.existing(id)?;
        record.tenant.status = status;
        record.tenant.updated_at = now;
        Ok(record)
    }

    /// Updated copy of a record with a namespace retention policy.
    pub fn with_retention(&self, id: &TenantId, namespace: Namespace, policy: RetentionConfig) -> Result<TenantRecord> {
        if policy.min_versions == 0 {
            return Err(StoreError::validation("min_versions must be at least 1"));
        }
        let mut record = self.existing(id)?;
        record.retention.insert(namespace, policy);
        Ok(record)
    }

    /// Install a record after it has been persisted.
    pub fn commit(&self, record: TenantRecord) {
        self.tenants.insert(record.tenant.id.clone(), record);
    }

    pub fn remove(&self, id: &TenantId) {
        self.tenants.remove(id);
    }

    fn existing(&self, id: &TenantId) -> Result<TenantRecord> {
        self.get(id)
            .ok_or_else(|| StoreError::not_found(format!("tenant {id}")))
    }
}
