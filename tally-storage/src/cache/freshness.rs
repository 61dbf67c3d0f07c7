//! Freshness metadata for cache reads.
//!
//! A [`CacheLookup`] tells the caller whether a key was fresh, present but
//! past its TTL, or absent. A [`CacheRead`] is the value handed back to the
//! caller together with where it came from and how old it is.

use std::time::Duration;

use tally_core::{CacheEntry, CacheLayerKind, Timestamp};

/// Outcome of looking a key up across the cache layers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Present and within its TTL.
    Fresh(CacheEntry),
    /// Present but expired. Already purged from the layers; usable only as a
    /// fallback when the source of truth cannot be reached.
    Stale(CacheEntry),
    /// Not cached anywhere.
    Miss,
}

impl CacheLookup {
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss)
    }

    /// The fresh entry, if any.
    pub fn fresh(self) -> Option<CacheEntry> {
        match self {
            CacheLookup::Fresh(entry) => Some(entry),
            _ => None,
        }
    }

    /// The stale entry, if any.
    pub fn stale(self) -> Option<CacheEntry> {
        match self {
            CacheLookup::Stale(entry) => Some(entry),
            _ => None,
        }
    }
}

/// A value together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    /// When the value was cached, or fetched for remote reads.
    cached_at: Timestamp,
    source: CacheLayerKind,
    stale: bool,
}

impl<T> CacheRead<T> {
    /// A fresh hit in one of the cache layers.
    pub fn from_cache(value: T, cached_at: Timestamp, layer: CacheLayerKind) -> Self {
        Self {
            value,
            cached_at,
            source: layer,
            stale: false,
        }
    }

    /// A value just fetched from the remote store.
    pub fn from_remote(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            cached_at: fetched_at,
            source: CacheLayerKind::Remote,
            stale: false,
        }
    }

    /// An expired cached value served because the remote store failed.
    pub fn stale_fallback(value: T, cached_at: Timestamp, layer: CacheLayerKind) -> Self {
        Self {
            value,
            cached_at,
            source: layer,
            stale: true,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> Timestamp {
        self.cached_at
    }

    pub fn source(&self) -> CacheLayerKind {
        self.source
    }

    /// True for fresh hits in a cache layer.
    pub fn is_cache_hit(&self) -> bool {
        self.source != CacheLayerKind::Remote && !self.stale
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Age of the value at `now`.
    pub fn staleness_at(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Transform the value, keeping the metadata.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheRead<U> {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            source: self.source,
            stale: self.stale,
        }
    }
}
