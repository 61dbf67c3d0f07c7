//! Multi-layer read-through cache with TTL.
//!
//! Layers are ordered fastest first:
//!
//! 1. [`MemoryLayer`]: in-process concurrent map, bounded by entry count.
//! 2. [`LmdbLayer`]: persistent local store, bounded by map size. Optional
//!    and best effort.
//!
//! The remote document store is the source of truth and lives outside this
//! module; callers fetch from it on a miss and call [`CacheManager::set`].
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheManager::new(CacheConfig::default())?;
//!
//! let key = CacheKey::document("novels", "42");
//! if cache.get(key.as_str()).await.is_none() {
//!     let doc = remote.fetch("novels", "42").await?;
//!     cache.set_for(key.as_str(), doc, DataType::Novel).await;
//! }
//!
//! // Chapters were edited: drop the novel and everything derived from it.
//! cache.invalidate(KeyPattern::entity("novels", "42")).await;
//! ```

pub mod freshness;
pub mod key;
pub mod lmdb_backend;
pub mod manager;
pub mod memory;
pub mod traits;

pub use freshness::{CacheLookup, CacheRead};
pub use key::{CacheKey, KeyPattern};
pub use lmdb_backend::{LmdbLayer, LmdbLayerError};
pub use manager::{CacheManager, CacheManagerStats, CACHE_COMPONENT};
pub use memory::MemoryLayer;
pub use traits::{CacheLayer, CacheStats};
