//! Per-data-key operation counters.
//!
//! Random 96-bit nonces collide with non-negligible probability after about
//! 2^32 messages under one key, so every encryption reserves a slot on the
//! data key's counter first. Counters are owned by a tenant-scoped registry
//! that callers pass into the engine.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strongbox_core::config::CryptoConfig;
use strongbox_core::{DataKeyId, TenantId};

use crate::error::{CryptoError, Result};

/// Atomic operation counter for one data key.
#[derive(Debug)]
pub struct UsageCounter {
    ops: AtomicU64,
    rotate_after: u64,
    max_ops: u64,
}

impl UsageCounter {
    fn new(rotate_after: u64, max_ops: u64) -> Self {
        Self {
            ops: AtomicU64::new(0),
            rotate_after,
            max_ops,
        }
    }

    /// Reserve one operation. Returns the operation's ordinal (1-based).
    pub fn reserve(&self, data_key_id: &DataKeyId) -> Result<u64> {
        let max = self.max_ops;
        self.ops
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|prev| prev + 1)
            .map_err(|n| CryptoError::DataKeyExhausted {
                data_key_id: data_key_id.to_string(),
                ops: n,
            })
    }

    /// Operations performed so far.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Acquire)
    }

    /// Whether the key has reached its retirement threshold.
    pub fn needs_rotation(&self) -> bool {
        self.ops() >= self.rotate_after
    }
}

/// Counters for every live data key of one tenant.
#[derive(Debug)]
pub struct KeyUsageRegistry {
    tenant: TenantId,
    rotate_after: u64,
    max_ops: u64,
    counters: DashMap<DataKeyId, Arc<UsageCounter>>,
}

impl KeyUsageRegistry {
    /// Create a registry using the thresholds from `config`.
    pub fn new(tenant: TenantId, config: &CryptoConfig) -> Self {
        Self::with_limits(tenant, config.rotate_after_ops, config.max_ops_per_data_key)
    }

    /// Create a registry with explicit thresholds.
    pub fn with_limits(tenant: TenantId, rotate_after: u64, max_ops: u64) -> Self {
        Self {
            tenant,
            rotate_after: rotate_after.min(max_ops),
            max_ops,
            counters: DashMap::new(),
        }
    }

    /// Tenant that owns these counters.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Counter for `id`, created on first use.
    pub fn counter(&self, id: &DataKeyId) -> Arc<UsageCounter> {
        self.counters
            .entry(id.clone())
            .or_insert_with(|| Arc::new(UsageCounter::new(self.rotate_after, self.max_ops)))
            .clone()
    }

    /// Stop tracking a data key that will not be used again.
    pub fn release(&self, id: &DataKeyId) {
        self.counters.remove(id);
    }

    /// Number of tracked data keys.
    pub fn active_keys(&self) -> usize {
        self.counters.len()
    }
}

/// Registries for all tenants.
#[derive(Debug)]
pub struct UsageRegistries {
    rotate_after: u64,
    max_ops: u64,
    tenants: DashMap<TenantId, Arc<KeyUsageRegistry>>,
}

impl UsageRegistries {
    pub fn new(config: &CryptoConfig) -> Self {
        Self {
            rotate_after: config.rotate_after_ops,
            max_ops: config.max_ops_per_data_key,
            tenants: DashMap::new(),
        }
    }

    /// Registry for `tenant`, created on first use.
    pub fn for_tenant(&self, tenant: &TenantId) -> Arc<KeyUsageRegistry> {
        self.tenants
            .entry(tenant.clone())
            .or_insert_with(|| {
                Arc::new(KeyUsageRegistry::with_limits(
                    tenant.clone(),
                    self.rotate_after,
                    self.max_ops,
                ))
            })
            .clone()
    }

    /// Drop a tenant's counters (tenant deletion).
    pub fn remove(&self, tenant: &TenantId) {
        self.tenants.remove(tenant);
    }
}
