// Two-tier decision cache: in-process LRU in front of an optional shared
// Redis tier with pub/sub invalidation. Never raises on the read path;
// every failure reads as a miss.

pub mod decision;
pub mod error;
pub mod shared;

pub use decision::{
    decision_cache_key, CacheSettings, CacheStatsSnapshot, DecisionCache, DecisionEntry,
    DecisionKey,
};
pub use error::{CacheError, Result};
pub use shared::{SharedCache, SharedCacheConfig};
