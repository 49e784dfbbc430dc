//! Read-through two-tier cache in front of the versioned store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strongbox_core::clock::{self, Clock, SharedClock};
use strongbox_core::config::CacheConfig;
use strongbox_core::{EntryKey, TenantId, TenantStatus};
use strongbox_store::{InvalidationEvent, StoreError, Version, VersionedStore};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::key::{CacheKey, VersionTag};
use crate::l1::{CachedVersion, Counters, L1Cache, TierStats};
use crate::l2::SharedCache;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
    pub store_loads: u64,
    pub invalidations: u64,
    pub lagged: u64,
}

/// Two-tier cache.
///
/// Consistency is eventual and bounded: a `Latest` entry is served only
/// while it is younger than `max_propagation` and no newer version of its
/// key is known. `Exact` entries are immutable and live until TTL,
/// retention, or tenant deletion removes them.
pub struct TieredCache {
    config: CacheConfig,
    store: Arc<VersionedStore>,
    l1: L1Cache,
    l2: Option<Arc<dyn SharedCache>>,
    l2_counters: Counters,
    clock: SharedClock,
    watermarks: DashMap<EntryKey, u64>,
    store_loads: AtomicU64,
    invalidations: AtomicU64,
    lagged: AtomicU64,
}

impl TieredCache {
    pub fn new(config: CacheConfig, store: Arc<VersionedStore>) -> Self {
        Self {
            l1: L1Cache::new(config.l1_capacity, config.l1_ttl()),
            config,
            store,
            l2: None,
            l2_counters: Counters::default(),
            clock: clock::system(),
            watermarks: DashMap::new(),
            store_loads: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
        }
    }

    /// Attach a shared second tier.
    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.l2 = Some(shared);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Read `entry` at `tag`: tier 1, then tier 2, then the store.
    pub async fn get(&self, entry: &EntryKey, tag: VersionTag) -> Result<Version> {
        self.ensure_tenant_readable(&entry.tenant)?;
        let key = CacheKey::new(entry.clone(), tag);
        let now = self.clock.now();

        if let Some(hit) = self.l1.get(&key, now) {
            if self.is_servable(&key, &hit, now) {
                debug!(key = %key, tier = "l1", "cache hit");
                return Ok(hit.version);
            }
            self.l1.remove(&key);
        }

        if let Some(hit) = self.l2_get(&key, now).await {
            debug!(key = %key, tier = "l2", "cache hit");
            self.l1.insert(key, hit.clone());
            return Ok(hit.version);
        }

        let version = self.store.get(entry, tag.as_request()).await?;
        self.store_loads.fetch_add(1, Ordering::Relaxed);
        self.observe(entry, version.number);

        let cached = CachedVersion {
            version: version.clone(),
            cached_at: now,
        };
        self.l2_set(&key, &cached).await;
        // A version that was only just observed as live can be cached under
        // its exact tag too.
        if tag == VersionTag::Latest {
            self.l1.insert(CacheKey::new(entry.clone(), VersionTag::Exact(version.number)), cached.clone());
        }
        self.l1.insert(key, cached);
        Ok(version)
    }

    /// Apply one invalidation event to both tiers.
    pub async fn invalidate(&self, event: &InvalidationEvent) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        match event {
            InvalidationEvent::Key { key, version, .. } => {
                self.observe(key, *version);
                let latest = CacheKey::latest(key.clone());
                self.l1.remove(&latest);
                self.l2_delete(&latest.shared_key()).await;
            }
            InvalidationEvent::Pruned { key, .. } => {
                self.l1.remove_entry(key);
                self.l2_delete_prefix(&CacheKey::entry_prefix(key)).await;
            }
            InvalidationEvent::Tenant { tenant, .. } => {
                self.l1.remove_tenant(tenant);
                self.watermarks.retain(|k, _| &k.tenant != tenant);
                self.l2_delete_prefix(&CacheKey::tenant_prefix(tenant)).await;
            }
        }
    }

    /// Subscribe to the store's invalidation bus and apply events until
    /// `shutdown` fires. The subscription is taken before this returns.
    pub fn spawn_invalidation(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.store.subscribe();
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => cache.invalidate(&event).await,
                        Err(RecvError::Lagged(missed)) => cache.on_lagged(missed),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("cache invalidation task stopped");
        })
    }

    /// Missed events cannot be replayed, so tier 1 starts over. Tier 2
    /// `Latest` entries age out within `max_propagation`.
    pub(crate) fn on_lagged(&self, missed: u64) {
        self.lagged.fetch_add(1, Ordering::Relaxed);
        let dropped = self.l1.clear();
        warn!(missed, dropped, "cache invalidation lagged; tier 1 flushed");
    }

    /// Drop everything from tier 1.
    pub fn clear(&self) {
        let dropped = self.l1.clear();
        info!(dropped, "cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.l1.stats(),
            l2: self.l2_counters.snapshot(),
            store_loads: self.store_loads.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }

    /// Highest version known for `entry`.
    pub fn watermark(&self, entry: &EntryKey) -> Option<u64> {
        self.watermarks.get(entry).map(|v| *v)
    }

    fn observe(&self, entry: &EntryKey, version: u64) {
        self.watermarks
            .entry(entry.clone())
            .and_modify(|v| *v = (*v).max(version))
            .or_insert(version);
    }

    fn ensure_tenant_readable(&self, tenant: &TenantId) -> Result<()> {
        match self.store.tenant(tenant) {
            Some(t) if t.status != TenantStatus::PendingDeletion => Ok(()),
            _ => Err(CacheError::Store(StoreError::TenantUnavailable(format!(
                "tenant {tenant} is not available"
            )))),
        }
    }

    fn is_servable(&self, key: &CacheKey, cached: &CachedVersion, now: DateTime<Utc>) -> bool {
        match key.tag {
            VersionTag::Exact(_) => true,
            VersionTag::Latest => {
                let fresh = now - cached.cached_at <= self.config.max_propagation();
                let current = self
                    .watermark(&key.entry)
                    .map_or(true, |known| cached.version.number >= known);
                fresh && current
            }
        }
    }

    async fn l2_get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CachedVersion> {
        let shared = self.l2.as_ref()?;
        let fetched = tokio::time::timeout(self.config.l2_timeout(), shared.get(&key.shared_key())).await;
        let bytes = match fetched {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                self.l2_counters.miss();
                return None;
            }
            Ok(Err(err)) => {
                self.l2_counters.error();
                self.l2_counters.miss();
                warn!(key = %key, error = %err, "shared cache read failed");
                return None;
            }
            Err(_) => {
                self.l2_counters.error();
                self.l2_counters.miss();
                warn!(key = %key, "shared cache read timed out");
                return None;
            }
        };

        let cached: CachedVersion = match serde_json::from_slice(&bytes) {
            Ok(cached) => cached,
            Err(err) => {
                self.l2_counters.error();
                self.l2_counters.miss();
                warn!(key = %key, error = %err, "discarding undecodable shared cache entry");
                return None;
            }
        };

        if self.is_servable(key, &cached, now) {
            self.l2_counters.hit();
            Some(cached)
        } else {
            self.l2_counters.miss();
            None
        }
    }

    async fn l2_set(&self, key: &CacheKey, cached: &CachedVersion) {
        let Some(shared) = self.l2.as_ref() else {
            return;
        };
        let bytes = match serde_json::to_vec(cached) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %key, error = %err, "could not encode shared cache entry");
                return;
            }
        };
        let ttl = match key.tag {
            VersionTag::Latest => self.config.max_propagation().min(self.config.l2_ttl()),
            VersionTag::Exact(_) => self.config.l2_ttl(),
        };
        let write = tokio::time::timeout(self.config.l2_timeout(), shared.set(&key.shared_key(), bytes, ttl)).await;
        if !matches!(write, Ok(Ok(()))) {
            self.l2_counters.error();
            warn!(key = %key, "shared cache write failed");
        }
    }

    async fn l2_delete(&self, shared_key: &str) {
        let Some(shared) = self.l2.as_ref() else {
            return;
        };
        let deleted = tokio::time::timeout(self.config.l2_timeout(), shared.delete(shared_key)).await;
        if !matches!(deleted, Ok(Ok(()))) {
            self.l2_counters.error();
            warn!(key = shared_key, "shared cache invalidation failed");
        } else {
            self.l2_counters.evicted(1);
        }
    }

    async fn l2_delete_prefix(&self, prefix: &str) {
        let Some(shared) = self.l2.as_ref() else {
            return;
        };
        let deleted = tokio::time::timeout(self.config.l2_timeout(), shared.delete_prefix(prefix)).await;
        if !matches!(deleted, Ok(Ok(()))) {
            self.l2_counters.error();
            warn!(prefix, "shared cache prefix invalidation failed");
        }
    }
}
