//! In-process memory layer.
//!
//! A concurrent map bounded by entry count. Two ordered indexes sit beside
//! the map, one by insertion time and one by expiry, so making room is a
//! few ordered pops instead of a scan. When full, expired entries go first;
//! if that frees nothing the entry with the oldest `inserted_at` is evicted.
//!
//! Every write takes the index lock, which makes the capacity check and the
//! insert one step. Reads only touch the map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use tally_core::{CacheEntry, CacheError, CacheLayerKind, TallyError, TallyResult, Timestamp};

use super::key::KeyPattern;
use super::traits::{CacheLayer, CacheStats};

/// Position of an entry in an index: a millisecond instant plus a sequence
/// number that breaks ties between entries written in the same millisecond.
type IndexKey = (i64, u64);

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    seq: u64,
}

impl Slot {
    fn inserted_key(&self) -> IndexKey {
        (self.entry.inserted_at.timestamp_millis(), self.seq)
    }

    fn expiry_key(&self) -> IndexKey {
        (expires_at_ms(&self.entry), self.seq)
    }
}

fn expires_at_ms(entry: &CacheEntry) -> i64 {
    let ttl_ms = i64::try_from(entry.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
    entry.inserted_at.timestamp_millis().saturating_add(ttl_ms)
}

#[derive(Debug, Default)]
struct EvictionIndex {
    by_insertion: BTreeMap<IndexKey, String>,
    by_expiry: BTreeMap<IndexKey, String>,
}

impl EvictionIndex {
    fn add(&mut self, key: &str, slot: &Slot) {
        self.by_insertion.insert(slot.inserted_key(), key.to_string());
        self.by_expiry.insert(slot.expiry_key(), key.to_string());
    }

    fn forget(&mut self, slot: &Slot) {
        self.by_insertion.remove(&slot.inserted_key());
        self.by_expiry.remove(&slot.expiry_key());
    }
}

/// Memory-backed cache layer.
#[derive(Debug)]
pub struct MemoryLayer {
    entries: DashMap<String, Slot>,
    index: Mutex<EvictionIndex>,
    capacity: usize,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryLayer {
    /// Create a layer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            index: Mutex::new(EvictionIndex::default()),
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lock_index(&self) -> TallyResult<MutexGuard<'_, EvictionIndex>> {
        self.index
            .lock()
            .map_err(|_| TallyError::Cache(CacheError::LockPoisoned))
    }

    /// Remove `key` from the map and both indexes.
    fn remove_indexed(&self, index: &mut EvictionIndex, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, slot)) => {
                index.forget(&slot);
                true
            }
            None => false,
        }
    }

    /// Remove every entry that expired at or before `now`.
    fn sweep_expired(&self, index: &mut EvictionIndex, now: Timestamp) -> u64 {
        let now_ms = now.timestamp_millis();
        let expired: Vec<String> = index
            .by_expiry
            .range(..=(now_ms, u64::MAX))
            .map(|(_, key)| key.clone())
            .collect();
        let mut removed = 0u64;
        for key in &expired {
            if self.remove_indexed(index, key) {
                removed += 1;
            }
        }
        removed
    }

    /// Make room for one more entry. Called with the index lock held, so no
    /// other writer can fill the freed slot first.
    fn make_room(&self, index: &mut EvictionIndex, now: Timestamp) {
        if self.entries.len() < self.capacity {
            return;
        }
        let swept = self.sweep_expired(index, now);
        if swept > 0 {
            self.evictions.fetch_add(swept, Ordering::Relaxed);
        }
        while self.entries.len() >= self.capacity {
            let oldest = index.by_insertion.first_key_value().map(|(_, key)| key.clone());
            match oldest {
                Some(key) => {
                    if self.remove_indexed(index, &key) {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn kind(&self) -> CacheLayerKind {
        CacheLayerKind::Memory
    }

    async fn get(&self, key: &str) -> TallyResult<Option<CacheEntry>> {
        match self.entries.get(key) {
            Some(slot) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(slot.entry.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, entry: &CacheEntry) -> TallyResult<()> {
        let mut index = self.lock_index()?;
        let slot = Slot {
            entry: entry.in_layer(CacheLayerKind::Memory),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        // An overwrite keeps its slot; only a new key needs room.
        let replaced = self.entries.remove(&entry.key);
        match &replaced {
            Some((_, old)) => index.forget(old),
            None => self.make_room(&mut index, entry.inserted_at),
        }
        index.add(&entry.key, &slot);
        self.entries.insert(entry.key.clone(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> TallyResult<bool> {
        let mut index = self.lock_index()?;
        Ok(self.remove_indexed(&mut index, key))
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> TallyResult<u64> {
        let mut index = self.lock_index()?;
        let mut removed = 0u64;
        self.entries.retain(|key, slot| {
            let keep = !pattern.matches(key);
            if !keep {
                index.forget(slot);
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn purge_expired(&self, now: Timestamp) -> TallyResult<u64> {
        let mut index = self.lock_index()?;
        Ok(self.sweep_expired(&mut index, now))
    }

    async fn stats(&self) -> TallyResult<CacheStats> {
        let memory_bytes = self
            .entries
            .iter()
            .map(|item| (item.key().len() + item.value().entry.value.to_string().len()) as u64)
            .sum();
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
