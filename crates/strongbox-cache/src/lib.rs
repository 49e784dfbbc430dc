//! # strongbox-cache
//!
//! Two-tier read cache for Strongbox.
//!
//! Tier 1 is an in-process LRU with TTL; tier 2 is any [`SharedCache`].
//! Entries hold stored versions, so secrets stay encrypted while cached.
//! Invalidation follows the store's event bus; the cache never writes back.

pub mod cache;
pub mod error;
pub mod key;
pub mod l1;
pub mod l2;

pub use cache::{CacheStats, TieredCache};
pub use error::{CacheError, Result};
pub use key::{CacheKey, VersionTag};
pub use l1::{CachedVersion, L1Cache, TierStats};
pub use l2::{InMemorySharedCache, SharedCache};
