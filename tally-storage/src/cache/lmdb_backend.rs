//! LMDB-backed persistent cache layer.
//!
//! Uses the heed crate (Rust bindings for LMDB) as the second cache layer:
//! a memory-mapped key-value store that survives restarts and has a hard
//! capacity ceiling (the map size).
//!
//! # Value Format
//!
//! `[inserted_at millis: 8 bytes LE][ttl_seconds: 8 bytes LE][json value]`
//!
//! Keys are the UTF-8 bytes of the cache key, so LMDB's sorted order keeps
//! related keys (`novels/42`, `novels/42/chapters`) adjacent.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::DateTime;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tally_core::{CacheEntry, CacheError, CacheLayerKind, TallyError, TallyResult, Timestamp};

use super::key::KeyPattern;
use super::traits::{CacheLayer, CacheStats};

const HEADER_LEN: usize = 16;

/// Error type for LMDB layer operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbLayerError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The map is full.
    #[error("LMDB map is full")]
    MapFull,

    /// Serialization error.
    #[error("Serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Deserialization error.
    #[error("Deserialization error for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for LmdbLayerError {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Mdb(heed::MdbError::MapFull) => LmdbLayerError::MapFull,
            other => LmdbLayerError::Transaction(other.to_string()),
        }
    }
}

/// Convert LmdbLayerError to TallyError.
impl From<LmdbLayerError> for TallyError {
    fn from(e: LmdbLayerError) -> Self {
        let cache = match e {
            LmdbLayerError::MapFull => CacheError::QuotaExceeded {
                layer: CacheLayerKind::Local,
            },
            LmdbLayerError::Serialization { key, reason } => {
                CacheError::Serialization { key, reason }
            }
            LmdbLayerError::Deserialization { key, reason } => {
                CacheError::Deserialization { key, reason }
            }
            other => CacheError::LayerUnavailable {
                layer: CacheLayerKind::Local,
                reason: other.to_string(),
            },
        };
        TallyError::Cache(cache)
    }
}

/// LMDB-backed cache layer.
pub struct LmdbLayer {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Hit/miss statistics. Best effort: a poisoned lock drops updates.
    stats: RwLock<CacheStats>,
}

impl std::fmt::Debug for LmdbLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbLayer")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbLayer {
    /// Open (or create) a persistent layer.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Capacity ceiling of the store in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbLayerError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: each path is opened by one LmdbLayer per process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbLayerError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbLayerError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbLayerError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbLayerError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    fn record_hit(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += 1;
        }
    }

    fn record_miss(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.misses += 1;
        }
    }

    fn encode(entry: &CacheEntry) -> Result<Vec<u8>, LmdbLayerError> {
        let value_bytes =
            serde_json::to_vec(&entry.value).map_err(|e| LmdbLayerError::Serialization {
                key: entry.key.clone(),
                reason: e.to_string(),
            })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + value_bytes.len());
        bytes.extend_from_slice(&entry.inserted_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&entry.ttl_seconds.to_le_bytes());
        bytes.extend_from_slice(&value_bytes);
        Ok(bytes)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<CacheEntry, LmdbLayerError> {
        let corrupt = |reason: &str| LmdbLayerError::Deserialization {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if bytes.len() < HEADER_LEN {
            return Err(corrupt("value shorter than header"));
        }

        let millis_bytes: [u8; 8] = bytes[0..8]
            .try_into()
            .map_err(|_| corrupt("invalid timestamp"))?;
        let ttl_bytes: [u8; 8] = bytes[8..16]
            .try_into()
            .map_err(|_| corrupt("invalid ttl"))?;

        let inserted_at = DateTime::from_timestamp_millis(i64::from_le_bytes(millis_bytes))
            .ok_or_else(|| corrupt("timestamp out of range"))?;
        let value = serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| {
            LmdbLayerError::Deserialization {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(CacheEntry::new(
            key,
            value,
            inserted_at,
            u64::from_le_bytes(ttl_bytes),
            CacheLayerKind::Local,
        ))
    }

    /// Collect keys starting with `prefix` whose entries satisfy `select`.
    /// An empty prefix walks the whole database.
    fn collect_keys<F>(&self, prefix: &str, mut select: F) -> Result<Vec<Vec<u8>>, LmdbLayerError>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        let rtxn = self.env.read_txn()?;

        let mut keys = Vec::new();
        for result in self.db.prefix_iter(&rtxn, prefix.as_bytes())? {
            match result {
                Ok((key, value)) => {
                    // Non UTF-8 keys were not written by this layer.
                    if let Ok(key_str) = std::str::from_utf8(key) {
                        if select(key_str, value) {
                            keys.push(key.to_vec());
                        }
                    }
                }
                Err(_) => continue,
            }
        }

        Ok(keys)
    }

    fn delete_keys(&self, keys: &[Vec<u8>]) -> Result<u64, LmdbLayerError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut wtxn = self.env.write_txn()?;

        let mut deleted = 0u64;
        for key in keys {
            if self.db.delete(&mut wtxn, key).unwrap_or(false) {
                deleted += 1;
            }
        }

        wtxn.commit()?;
        Ok(deleted)
    }
}

#[async_trait]
impl CacheLayer for LmdbLayer {
    fn kind(&self) -> CacheLayerKind {
        CacheLayerKind::Local
    }

    async fn get(&self, key: &str) -> TallyResult<Option<CacheEntry>> {
        let decoded = {
            let rtxn = self.env.read_txn().map_err(LmdbLayerError::from)?;
            match self.db.get(&rtxn, key.as_bytes()) {
                Ok(Some(bytes)) => Some(Self::decode(key, bytes)),
                Ok(None) => None,
                Err(e) => {
                    self.record_miss();
                    return Err(LmdbLayerError::from(e).into());
                }
            }
        };

        match decoded {
            Some(Ok(entry)) => {
                self.record_hit();
                Ok(Some(entry))
            }
            Some(Err(e)) => {
                // A value this layer cannot read is dropped and served as a miss.
                tracing::warn!(key, error = %e, "Dropping corrupt LMDB cache entry");
                self.record_miss();
                self.delete_keys(&[key.as_bytes().to_vec()])?;
                Ok(None)
            }
            None => {
                self.record_miss();
                Ok(None)
            }
        }
    }

    async fn put(&self, entry: &CacheEntry) -> TallyResult<()> {
        let bytes = Self::encode(entry)?;

        let mut wtxn = self.env.write_txn().map_err(LmdbLayerError::from)?;
        self.db
            .put(&mut wtxn, entry.key.as_bytes(), &bytes)
            .map_err(LmdbLayerError::from)?;
        wtxn.commit().map_err(LmdbLayerError::from)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> TallyResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(LmdbLayerError::from)?;
        let deleted = self
            .db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(LmdbLayerError::from)?;
        wtxn.commit().map_err(LmdbLayerError::from)?;
        Ok(deleted)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> TallyResult<u64> {
        let keys = match pattern {
            KeyPattern::Exact(key) => vec![key.as_bytes().to_vec()],
            KeyPattern::Prefix(_) | KeyPattern::Subtree(_) => {
                self.collect_keys(pattern.literal_prefix(), |key, _| pattern.matches(key))?
            }
        };
        Ok(self.delete_keys(&keys)?)
    }

    async fn purge_expired(&self, now: Timestamp) -> TallyResult<u64> {
        // Undecodable values count as expired.
        let keys = self.collect_keys("", |key, value| match Self::decode(key, value) {
            Ok(entry) => entry.is_expired_at(now),
            Err(_) => true,
        })?;
        Ok(self.delete_keys(&keys)?)
    }

    async fn stats(&self) -> TallyResult<CacheStats> {
        let entry_count = {
            let rtxn = self.env.read_txn().map_err(LmdbLayerError::from)?;
            self.db.len(&rtxn).map_err(LmdbLayerError::from)?
        };
        let mut stats = self.stats.read().map(|s| s.clone()).unwrap_or_default();
        stats.entry_count = entry_count;
        Ok(stats)
    }
}
