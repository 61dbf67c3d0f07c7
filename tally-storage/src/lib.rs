//! Tally Storage - cache layers
//!
//! The memory and persistent cache layers and the manager that routes reads
//! and writes across them.

pub mod cache;

pub use cache::{
    CacheKey, CacheLayer, CacheLookup, CacheManager, CacheManagerStats, CacheRead, CacheStats,
    KeyPattern, LmdbLayer, LmdbLayerError, MemoryLayer, CACHE_COMPONENT,
};
