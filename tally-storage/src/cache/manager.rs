//! Multi-layer cache manager.
//!
//! Reads walk the layers fastest first (memory, then the persistent local
//! store); writes go to every layer. Only the memory layer is mandatory. Any
//! failure in the persistent layer is logged, counted and otherwise ignored,
//! so the manager silently degrades to memory-only operation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_core::{
    CacheConfig, CacheEntry, CacheError, CacheLayerKind, Clock, DataType, HealthCheck,
    SystemClock, TallyError, TallyResult,
};
use tracing::{debug, warn};

use super::freshness::CacheLookup;
use super::key::KeyPattern;
use super::lmdb_backend::LmdbLayer;
use super::memory::MemoryLayer;
use super::traits::{CacheLayer, CacheStats};

/// Health check component name.
pub const CACHE_COMPONENT: &str = "cache";

/// Aggregate statistics across layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheManagerStats {
    /// Fresh hits in any layer.
    pub hits: u64,
    /// Lookups that found nothing fresh.
    pub misses: u64,
    /// Misses that still found an expired value.
    pub stale: u64,
    /// Persistent-layer hits copied into memory.
    pub promotions: u64,
    /// Persistent-layer operations that failed and were skipped.
    pub degraded_errors: u64,
    pub memory: CacheStats,
    /// `None` when no persistent layer is configured.
    pub local: Option<CacheStats>,
}

impl CacheManagerStats {
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

#[derive(Debug, Default)]
struct ManagerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    promotions: AtomicU64,
    degraded_errors: AtomicU64,
}

/// Read-through cache across a memory layer and an optional persistent layer.
///
/// Construct one per application and share it (it is cheap to wrap in an
/// `Arc`); there is no global instance.
pub struct CacheManager {
    config: CacheConfig,
    memory: MemoryLayer,
    persistent: Option<Arc<dyn CacheLayer>>,
    clock: Arc<dyn Clock>,
    counters: ManagerCounters,
    /// False after the last persistent-layer operation failed.
    persistent_ok: AtomicBool,
    last_persistent_error: RwLock<Option<String>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("memory_entries", &self.memory.len())
            .field("persistent", &self.persistent.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Create a cache manager from configuration.
    ///
    /// Invalid configuration fails fast. A persistent layer that cannot be
    /// opened does not: the manager starts in memory-only mode and reports
    /// itself degraded.
    pub fn new(config: CacheConfig) -> TallyResult<Self> {
        config.validate()?;

        let mut manager = Self::build(config.clone());

        if config.persistent_enabled {
            if let Some(path) = config.persistent_path.as_ref() {
                match LmdbLayer::open(path, config.persistent_max_size_mb) {
                    Ok(layer) => manager.persistent = Some(Arc::new(layer)),
                    Err(e) => {
                        let err = TallyError::from(e);
                        manager.record_degraded("open", &err);
                    }
                }
            }
        }

        Ok(manager)
    }

    /// Create a memory-only cache manager.
    pub fn in_memory(config: CacheConfig) -> TallyResult<Self> {
        let config = CacheConfig {
            persistent_enabled: false,
            ..config
        };
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CacheConfig) -> Self {
        Self {
            memory: MemoryLayer::new(config.max_memory_entries),
            config,
            persistent: None,
            clock: Arc::new(SystemClock),
            counters: ManagerCounters::default(),
            persistent_ok: AtomicBool::new(true),
            last_persistent_error: RwLock::new(None),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a custom second layer instead of the configured one.
    pub fn with_persistent_layer(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.persistent = Some(layer);
        self.persistent_ok.store(true, Ordering::Relaxed);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn has_persistent_layer(&self) -> bool {
        self.persistent.is_some()
    }

    /// TTL for a data type under this manager's configuration.
    pub fn ttl_for(&self, data_type: DataType) -> Duration {
        self.config.ttl_for(data_type)
    }

    fn record_degraded(&self, operation: &'static str, err: &TallyError) {
        self.counters.degraded_errors.fetch_add(1, Ordering::Relaxed);
        self.persistent_ok.store(false, Ordering::Relaxed);
        if let Ok(mut last) = self.last_persistent_error.write() {
            *last = Some(err.to_string());
        }
        warn!(
            layer = "local",
            operation,
            error = %err,
            "Persistent cache layer failed, continuing with memory only"
        );
    }

    fn record_persistent_ok(&self) {
        self.persistent_ok.store(true, Ordering::Relaxed);
    }

    /// Look a key up across layers, classifying it as fresh, stale or absent.
    ///
    /// Expired entries are deleted from the layer they were found in; the
    /// newest expired copy is still handed back once as [`CacheLookup::Stale`].
    /// A fresh persistent-layer hit is promoted into memory.
    pub async fn lookup(&self, key: &str) -> CacheLookup {
        let now = self.clock.now();
        let mut stale: Option<CacheEntry> = None;

        match self.memory.get(key).await {
            Ok(Some(entry)) if entry.is_fresh_at(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Fresh(entry);
            }
            Ok(Some(entry)) => {
                if let Err(e) = self.memory.delete(key).await {
                    warn!(key, error = %e, "Memory cache delete failed");
                }
                stale = Some(entry);
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "Memory cache read failed"),
        }

        if let Some(layer) = self.persistent.as_ref() {
            match layer.get(key).await {
                Ok(Some(entry)) if entry.is_fresh_at(now) => {
                    self.record_persistent_ok();
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.promote(&entry).await;
                    return CacheLookup::Fresh(entry);
                }
                Ok(Some(entry)) => {
                    self.record_persistent_ok();
                    if let Err(e) = layer.delete(key).await {
                        self.record_degraded("delete", &e);
                    }
                    let newer = stale
                        .as_ref()
                        .map_or(true, |s| entry.inserted_at > s.inserted_at);
                    if newer {
                        stale = Some(entry);
                    }
                }
                Ok(None) => self.record_persistent_ok(),
                Err(e) => self.record_degraded("get", &e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        match stale {
            Some(entry) => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Stale(entry)
            }
            None => CacheLookup::Miss,
        }
    }

    /// Copy a persistent-layer hit into memory, keeping its original
    /// insertion time so it expires at the same instant.
    async fn promote(&self, entry: &CacheEntry) {
        if self.memory.put(&entry.in_layer(CacheLayerKind::Memory)).await.is_ok() {
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %entry.key, "Promoted persistent cache entry to memory");
        }
    }

    /// Get a fresh value. Expired or absent keys are misses.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lookup(key).await.fresh().map(|entry| entry.value)
    }

    /// Get a fresh entry with its metadata.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        self.lookup(key).await.fresh()
    }

    /// Write a value to every layer. Never fails: a persistent-layer error
    /// leaves the value in memory only.
    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let entry = CacheEntry::new(
            key,
            value,
            self.clock.now(),
            ttl.as_secs(),
            CacheLayerKind::Memory,
        );

        if let Err(e) = self.memory.put(&entry).await {
            warn!(key, error = %e, "Memory cache write failed");
        }

        if let Some(layer) = self.persistent.as_ref() {
            match layer.put(&entry.in_layer(CacheLayerKind::Local)).await {
                Ok(()) => self.record_persistent_ok(),
                Err(e) => self.record_degraded("put", &e),
            }
        }
    }

    /// Write a value with the TTL of its data type.
    pub async fn set_for(&self, key: &str, value: serde_json::Value, data_type: DataType) {
        self.set(key, value, self.ttl_for(data_type)).await;
    }

    /// Remove every key matching the pattern from every layer.
    ///
    /// Accepts a [`KeyPattern`], a [`CacheKey`](super::CacheKey) or a string
    /// (a trailing `*` makes it a prefix). Returns the number of entries
    /// removed across layers.
    pub async fn invalidate(&self, pattern: impl Into<KeyPattern>) -> u64 {
        let pattern = pattern.into();
        let mut removed = match self.memory.delete_matching(&pattern).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Memory cache invalidation failed");
                0
            }
        };

        if let Some(layer) = self.persistent.as_ref() {
            match layer.delete_matching(&pattern).await {
                Ok(n) => {
                    self.record_persistent_ok();
                    removed += n;
                }
                Err(e) => self.record_degraded("invalidate", &e),
            }
        }

        debug!(pattern = ?pattern, removed, "Invalidated cache entries");
        removed
    }

    /// Read-through helper: return the fresh cached value or call `fetch`,
    /// cache its result and return it. Fetch errors are not cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> TallyResult<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TallyResult<serde_json::Value>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = fetch().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Typed get. A cached value of the wrong shape is an error.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> TallyResult<Option<T>> {
        match self.get(key).await {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                TallyError::Cache(CacheError::Deserialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }),
            None => Ok(None),
        }
    }

    /// Typed set.
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> TallyResult<()> {
        let json = serde_json::to_value(value).map_err(|e| {
            TallyError::Cache(CacheError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })?;
        self.set(key, json, ttl).await;
        Ok(())
    }

    /// Sweep expired entries from every layer. Returns the number removed.
    pub async fn purge_expired(&self) -> u64 {
        let now = self.clock.now();
        let mut removed = self.memory.purge_expired(now).await.unwrap_or(0);

        if let Some(layer) = self.persistent.as_ref() {
            match layer.purge_expired(now).await {
                Ok(n) => {
                    self.record_persistent_ok();
                    removed += n;
                }
                Err(e) => self.record_degraded("purge_expired", &e),
            }
        }
        removed
    }

    /// Statistics across layers.
    pub async fn stats(&self) -> CacheManagerStats {
        let memory = self.memory.stats().await.unwrap_or_default();
        let local = match self.persistent.as_ref() {
            Some(layer) => match layer.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    self.record_degraded("stats", &e);
                    Some(CacheStats::default())
                }
            },
            None => None,
        };

        CacheManagerStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            degraded_errors: self.counters.degraded_errors.load(Ordering::Relaxed),
            memory,
            local,
        }
    }

    /// Health of the cache. Degraded when the persistent layer was
    /// configured but failed to open or failed its last operation.
    pub async fn health(&self) -> HealthCheck {
        let stats = self.stats().await;
        let persistent_failed = (self.config.persistent_enabled && self.persistent.is_none())
            || !self.persistent_ok.load(Ordering::Relaxed);

        let check = if persistent_failed {
            let reason = self
                .last_persistent_error
                .read()
                .ok()
                .and_then(|e| e.clone())
                .unwrap_or_else(|| "persistent layer unavailable".to_string());
            HealthCheck::degraded(CACHE_COMPONENT, reason)
        } else {
            HealthCheck::healthy(CACHE_COMPONENT)
        };

        check
            .with_metadata("memory_entries", serde_json::json!(stats.memory.entry_count))
            .with_metadata("hit_rate", serde_json::json!(stats.hit_rate()))
            .with_metadata("degraded_errors", serde_json::json!(stats.degraded_errors))
    }
}
