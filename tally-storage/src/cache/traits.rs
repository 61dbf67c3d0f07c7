//! Cache layer trait and statistics.

use async_trait::async_trait;
use tally_core::{CacheEntry, CacheLayerKind, TallyResult, Timestamp};

use super::key::KeyPattern;

/// One layer of the multi-layer cache.
///
/// Layers store entries verbatim and never judge freshness themselves; the
/// cache manager compares `inserted_at + ttl` against its clock. Layers must
/// be safe to share across tasks.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Which layer this is.
    fn kind(&self) -> CacheLayerKind;

    /// Get the entry stored under `key`, expired or not.
    async fn get(&self, key: &str) -> TallyResult<Option<CacheEntry>>;

    /// Store an entry, replacing any previous entry under the same key.
    async fn put(&self, entry: &CacheEntry) -> TallyResult<()>;

    /// Delete one key. Returns true if something was removed.
    async fn delete(&self, key: &str) -> TallyResult<bool>;

    /// Delete every key matching the pattern. Returns the number removed.
    async fn delete_matching(&self, pattern: &KeyPattern) -> TallyResult<u64>;

    /// Remove every entry that is no longer fresh at `now`.
    async fn purge_expired(&self, now: Timestamp) -> TallyResult<u64>;

    /// Get layer statistics.
    async fn stats(&self) -> TallyResult<CacheStats>;
}

/// Statistics about one cache layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found an entry.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
