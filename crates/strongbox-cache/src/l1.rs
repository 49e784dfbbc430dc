//! Tier 1: bounded in-process cache with LRU eviction and TTL.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use strongbox_core::{EntryKey, TenantId};
use strongbox_store::Version;

use crate::key::CacheKey;

/// A cached version and when it was fetched from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVersion {
    pub version: Version,
    pub cached_at: DateTime<Utc>,
}

/// Per-tier counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub errors: u64,
}

impl TierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct Slot {
    value: CachedVersion,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<CacheKey, Slot>,
    /// Access order: oldest tick first.
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, key: &CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    fn remove_where(&mut self, pred: impl Fn(&CacheKey) -> bool) -> u64 {
        let doomed: Vec<CacheKey> = self.slots.keys().filter(|k| pred(k)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len() as u64
    }
}

/// Tier-1 cache.
pub struct L1Cache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
    counters: Counters,
}

impl L1Cache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
            counters: Counters::default(),
        }
    }

    /// Entry for `key` if present and younger than the TTL.
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CachedVersion> {
        let mut inner = self.inner.lock();
        let expired = match inner.slots.get(key) {
            None => {
                self.counters.miss();
                return None;
            }
            Some(slot) => now - slot.value.cached_at > self.ttl,
        };
        if expired {
            inner.remove(key);
            self.counters.evicted(1);
            self.counters.miss();
            return None;
        }
        inner.touch(key);
        self.counters.hit();
        inner.slots.get(key).map(|s| s.value.clone())
    }

    /// Insert, evicting the least recently used entry when full.
    pub fn insert(&self, key: CacheKey, value: CachedVersion) {
        let mut inner = self.inner.lock();
        inner.remove(&key);
        while inner.slots.len() >= self.capacity {
            let Some((_, lru)) = inner.order.pop_first() else {
                break;
            };
            inner.slots.remove(&lru);
            self.counters.evicted(1);
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert(tick, key.clone());
        inner.slots.insert(key, Slot { value, tick });
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.inner.lock().remove(key);
        if removed {
            self.counters.evicted(1);
        }
        removed
    }

    /// Drop every tag cached for `entry`.
    pub fn remove_entry(&self, entry: &EntryKey) -> u64 {
        let n = self.inner.lock().remove_where(|k| &k.entry == entry);
        self.counters.evicted(n);
        n
    }

    /// Drop everything cached for `tenant`.
    pub fn remove_tenant(&self, tenant: &TenantId) -> u64 {
        let n = self.inner.lock().remove_where(|k| k.tenant() == tenant);
        self.counters.evicted(n);
        n
    }

    pub fn clear(&self) -> u64 {
        let mut inner = self.inner.lock();
        let n = inner.slots.len() as u64;
        inner.slots.clear();
        inner.order.clear();
        self.counters.evicted(n);
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }
}
