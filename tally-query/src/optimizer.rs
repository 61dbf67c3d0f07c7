//! Query optimizer facade
//!
//! Sits between callers and the [`RemoteStore`]. Every read first consults
//! the [`CacheManager`]; only misses reach the store, and those are folded
//! into as few remote calls as the configuration allows:
//!
//! - `batch_read` deduplicates document ids across requests and fetches them
//!   in chunks of `max_batch_size`.
//! - `consolidate_query` merges queries that differ only by one equality
//!   value into `in` queries (see [`plan_consolidation`]).
//!
//! Remote calls run on their own tasks and write their results back to the
//! cache when they finish, even if the caller has gone away. The caller waits
//! at most `remote_timeout` for each call; a timed-out request falls back to
//! the expired cached value when one exists. Otherwise the cache is populated
//! before the call returns.
//!
//! With `cache_enabled = false` the facade passes through: one remote call
//! per request, no cache traffic, and an optimization ratio of zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use tally_core::{DataType, OptimizationConfig, RemoteError, TallyError, TallyResult};
use tally_monitor::PerformanceTracker;
use tally_storage::{CacheKey, CacheLookup, CacheManager, CacheRead, KeyPattern};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::query::{plan_consolidation, Query};
use crate::remote::{Document, RemoteStore};

/// Result of one read request.
pub type ReadOutcome = TallyResult<CacheRead<Vec<Document>>>;

// ============================================================================
// REQUESTS
// ============================================================================

/// What a read request asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadTarget {
    /// Documents by id, returned in request order. Missing ids are omitted.
    Ids(Vec<String>),
    /// Documents matching a query.
    Query(Query),
}

/// One entry of a `batch_read`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub collection: String,
    pub target: ReadTarget,
    /// Overrides the key derived from the target.
    pub cache_key: Option<CacheKey>,
    /// Picks the TTL. Falls back to `OptimizationConfig::default_data_type`.
    pub data_type: Option<DataType>,
}

impl ReadRequest {
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::documents(collection, vec![id.into()])
    }

    pub fn documents(collection: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            collection: collection.into(),
            target: ReadTarget::Ids(ids),
            cache_key: None,
            data_type: None,
        }
    }

    pub fn query(query: Query) -> Self {
        Self {
            collection: query.collection.clone(),
            target: ReadTarget::Query(query),
            cache_key: None,
            data_type: None,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<CacheKey>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    /// Cache key of this request: the explicit key, `collection/id` for a
    /// single document, or `collection?...` otherwise.
    pub fn effective_cache_key(&self) -> CacheKey {
        if let Some(key) = &self.cache_key {
            return key.clone();
        }
        match &self.target {
            ReadTarget::Ids(ids) if ids.len() == 1 => CacheKey::document(&self.collection, &ids[0]),
            ReadTarget::Ids(ids) => {
                // Length-prefixed so ids containing the separator stay distinct.
                let encoded: Vec<String> =
                    ids.iter().map(|id| format!("{}:{}", id.len(), id)).collect();
                CacheKey::query(&self.collection, &format!("ids={}", encoded.join(",")))
            }
            ReadTarget::Query(query) => CacheKey::query(&self.collection, &query.fingerprint()),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the optimizer.
#[derive(Debug, Default)]
pub struct OptimizerMetrics {
    /// Requests and queries received
    pub total_queries: AtomicU64,
    /// Documents actually read from the remote store (billed)
    pub total_reads: AtomicU64,
    /// Documents handed to callers, wherever they came from
    pub naive_reads: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Remote calls issued
    pub remote_calls: AtomicU64,
    pub remote_failures: AtomicU64,
    /// Expired values served because the remote call timed out
    pub stale_served: AtomicU64,
    /// Remote calls avoided by merging queries
    pub queries_merged: AtomicU64,
}

impl OptimizerMetrics {
    pub fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            naive_reads: self.naive_reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            queries_merged: self.queries_merged.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Snapshot of optimizer metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptimizerSnapshot {
    pub total_queries: u64,
    pub total_reads: u64,
    pub naive_reads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub remote_calls: u64,
    pub remote_failures: u64,
    pub stale_served: u64,
    pub queries_merged: u64,
}

impl OptimizerSnapshot {
    /// `1 - actual_reads / naive_reads`, 0 when nothing was read.
    pub fn optimization_ratio(&self) -> f64 {
        if self.naive_reads == 0 {
            return 0.0;
        }
        (1.0 - self.total_reads as f64 / self.naive_reads as f64).max(0.0)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

// ============================================================================
// OPTIMIZER
// ============================================================================

enum Cached<T> {
    Fresh(CacheRead<T>),
    Stale(CacheRead<T>),
    Miss,
}

#[derive(Clone)]
enum CallKind {
    Ids(Vec<String>),
    Query(Query),
}

impl CallKind {
    fn operation(&self) -> &'static str {
        match self {
            CallKind::Ids(_) => "get",
            CallKind::Query(_) => "list",
        }
    }
}

/// One planned remote call and the requests it serves.
struct RemoteCall {
    collection: String,
    kind: CallKind,
    serves: Vec<usize>,
}

type RemoteResult = Result<Vec<Document>, RemoteError>;

/// Handle to a spawned remote call. Clones observe the same result.
type InFlight = Shared<BoxFuture<'static, RemoteResult>>;

/// Cache writes derived from the results of a set of remote calls.
type Writes = Vec<(CacheKey, serde_json::Value, Duration)>;

/// Queries sent to the store and how their results map back.
struct QueryDispatch {
    calls: Vec<InFlight>,
    collections: Vec<String>,
    /// For each merged query, the indices of the original queries it answers.
    /// `None` when every query was sent as is.
    members: Option<Vec<Vec<usize>>>,
}

/// Cache-backed read facade over a remote document store.
pub struct QueryOptimizer {
    store: Arc<dyn RemoteStore>,
    cache: Arc<CacheManager>,
    tracker: Option<Arc<PerformanceTracker>>,
    config: OptimizationConfig,
    metrics: Arc<OptimizerMetrics>,
}

impl std::fmt::Debug for QueryOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptimizer")
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl QueryOptimizer {
    /// Create an optimizer. Invalid configuration fails fast.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<CacheManager>,
        config: OptimizationConfig,
    ) -> TallyResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            cache,
            tracker: None,
            config,
            metrics: Arc::new(OptimizerMetrics::default()),
        })
    }

    /// Report reads, rule evaluations and latencies to a tracker.
    pub fn with_tracker(mut self, tracker: Arc<PerformanceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn metrics(&self) -> OptimizerSnapshot {
        self.metrics.snapshot()
    }

    fn ttl(&self, data_type: Option<DataType>) -> Duration {
        self.cache
            .ttl_for(data_type.unwrap_or(self.config.default_data_type))
    }

    // ------------------------------------------------------------------------
    // Cache access
    // ------------------------------------------------------------------------

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey, operation: &str) -> Cached<T> {
        let started = Instant::now();
        let lookup = self.cache.lookup(key.as_str()).await;
        if let Some(tracker) = &self.tracker {
            tracker.track_cache_performance(operation, lookup.is_fresh(), started.elapsed());
        }

        let (entry, fresh) = match lookup {
            CacheLookup::Fresh(entry) => (entry, true),
            CacheLookup::Stale(entry) => (entry, false),
            CacheLookup::Miss => return Cached::Miss,
        };
        match serde_json::from_value::<T>(entry.value) {
            Ok(value) if fresh => {
                Cached::Fresh(CacheRead::from_cache(value, entry.inserted_at, entry.layer))
            }
            Ok(value) => {
                Cached::Stale(CacheRead::stale_fallback(value, entry.inserted_at, entry.layer))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value has an unexpected shape, dropping it");
                self.cache.invalidate(key).await;
                Cached::Miss
            }
        }
    }

    fn served_from_cache(&self, collection: &str, documents: usize) {
        OptimizerMetrics::add(&self.metrics.cache_hits, 1);
        OptimizerMetrics::add(&self.metrics.naive_reads, documents);
        if let Some(tracker) = &self.tracker {
            tracker.track_read(collection, documents as u64, true);
        }
    }

    /// Resolve a failed request: an expired cached value when the call timed
    /// out, the error otherwise.
    fn fail_or_stale(
        &self,
        error: RemoteError,
        stale: Option<CacheRead<Vec<Document>>>,
    ) -> ReadOutcome {
        match (error, stale) {
            (RemoteError::Timeout { collection, .. }, Some(read)) => {
                OptimizerMetrics::add(&self.metrics.stale_served, 1);
                OptimizerMetrics::add(&self.metrics.naive_reads, read.value().len());
                warn!(
                    collection = %collection,
                    cached_at = %read.cached_at(),
                    "Remote read timed out, serving expired cached value"
                );
                Ok(read)
            }
            (error, _) => Err(TallyError::from(error)),
        }
    }

    // ------------------------------------------------------------------------
    // Remote access
    // ------------------------------------------------------------------------

    /// Start a remote call on its own task.
    ///
    /// The call runs to completion even when every caller has stopped
    /// waiting for it, so its result can still reach the cache.
    fn spawn_call(&self, collection: &str, kind: CallKind) -> InFlight {
        OptimizerMetrics::add(&self.metrics.remote_calls, 1);
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let tracker = self.tracker.clone();
        let collection = collection.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match &kind {
                CallKind::Ids(ids) => store.fetch_documents(&collection, ids).await,
                CallKind::Query(query) => store.run_query(query).await,
            };
            record_call(
                &metrics,
                tracker.as_deref(),
                &collection,
                kind.operation(),
                started.elapsed(),
                &outcome,
            );
            outcome
        })
        .map(|joined| {
            joined.unwrap_or_else(|e| {
                Err(RemoteError::Other {
                    reason: format!("remote call task failed: {e}"),
                })
            })
        })
        .boxed()
        .shared()
    }

    /// Wait for a call, giving up after `remote_timeout`. The call itself
    /// keeps running.
    async fn await_call(&self, call: InFlight, collection: &str) -> RemoteResult {
        match tokio::time::timeout(self.config.remote_timeout(), call).await {
            Ok(result) => result,
            Err(_) => {
                OptimizerMetrics::add(&self.metrics.remote_failures, 1);
                warn!(
                    collection,
                    timeout_ms = self.config.remote_timeout_ms,
                    "Remote read timed out, call continues in the background"
                );
                Err(RemoteError::Timeout {
                    collection: collection.to_string(),
                    timeout_ms: self.config.remote_timeout_ms,
                })
            }
        }
    }

    async fn await_all(&self, calls: &[InFlight], collections: &[String]) -> Vec<RemoteResult> {
        join_all(
            calls
                .iter()
                .zip(collections)
                .map(|(call, collection)| self.await_call(call.clone(), collection)),
        )
        .await
    }

    /// Write results back to the cache on a task of its own once every call
    /// has settled.
    fn spawn_population<F>(&self, calls: &[InFlight], writes: F) -> JoinHandle<()>
    where
        F: FnOnce(&[RemoteResult]) -> Writes + Send + 'static,
    {
        let cache = self.cache.clone();
        let calls = calls.to_vec();
        tokio::spawn(async move {
            let results = join_all(calls).await;
            for (key, value, ttl) in writes(&results) {
                cache.set(key.as_str(), value, ttl).await;
            }
        })
    }

    /// Let the caller see its own writes: wait for the population task unless
    /// a call timed out, in which case it finishes in the background.
    async fn settle(&self, population: JoinHandle<()>, results: &[RemoteResult]) {
        let timed_out = results
            .iter()
            .any(|r| matches!(r, Err(RemoteError::Timeout { .. })));
        if timed_out {
            return;
        }
        if let Err(e) = population.await {
            warn!(error = %e, "Cache population task failed");
        }
    }

    /// Group the missed requests into remote calls.
    fn plan_calls(&self, requests: &[ReadRequest], missed: &[usize]) -> Vec<RemoteCall> {
        let chunk = self.config.max_batch_size;
        let mut calls: Vec<RemoteCall> = Vec::new();

        if self.config.enable_batch_reads {
            // Unique ids per collection, first-seen order.
            let mut by_collection: Vec<(String, Vec<String>, Vec<usize>)> = Vec::new();
            for &i in missed {
                let ReadTarget::Ids(ids) = &requests[i].target else {
                    continue;
                };
                let collection = &requests[i].collection;
                let pos = match by_collection.iter().position(|(c, _, _)| c == collection) {
                    Some(pos) => pos,
                    None => {
                        by_collection.push((collection.clone(), Vec::new(), Vec::new()));
                        by_collection.len() - 1
                    }
                };
                let (_, unique, served) = &mut by_collection[pos];
                for id in ids {
                    if !unique.contains(id) {
                        unique.push(id.clone());
                    }
                }
                served.push(i);
            }

            for (collection, unique, served) in by_collection {
                for ids in unique.chunks(chunk) {
                    let serves = served
                        .iter()
                        .copied()
                        .filter(|&i| match &requests[i].target {
                            ReadTarget::Ids(wanted) => wanted.iter().any(|id| ids.contains(id)),
                            ReadTarget::Query(_) => false,
                        })
                        .collect();
                    calls.push(RemoteCall {
                        collection: collection.clone(),
                        kind: CallKind::Ids(ids.to_vec()),
                        serves,
                    });
                }
            }
        } else {
            for &i in missed {
                let ReadTarget::Ids(ids) = &requests[i].target else {
                    continue;
                };
                for ids in unique_ids(ids).chunks(chunk) {
                    calls.push(RemoteCall {
                        collection: requests[i].collection.clone(),
                        kind: CallKind::Ids(ids.to_vec()),
                        serves: vec![i],
                    });
                }
            }
        }

        // Identical queries in one batch share a call.
        let mut by_fingerprint: HashMap<(String, String), usize> = HashMap::new();
        for &i in missed {
            let ReadTarget::Query(query) = &requests[i].target else {
                continue;
            };
            let fingerprint = (query.collection.clone(), query.fingerprint());
            match by_fingerprint.get(&fingerprint) {
                Some(&call) => calls[call].serves.push(i),
                None => {
                    by_fingerprint.insert(fingerprint, calls.len());
                    calls.push(RemoteCall {
                        collection: query.collection.clone(),
                        kind: CallKind::Query(query.clone()),
                        serves: vec![i],
                    });
                }
            }
        }

        calls
    }

    // ------------------------------------------------------------------------
    // batch_read
    // ------------------------------------------------------------------------

    /// Resolve several read requests at once.
    ///
    /// The output is index-aligned with `requests`. A remote failure fails
    /// only the requests whose documents came from the failed call.
    pub async fn batch_read(&self, requests: Vec<ReadRequest>) -> Vec<ReadOutcome> {
        OptimizerMetrics::add(&self.metrics.total_queries, requests.len());
        if requests.is_empty() {
            return Vec::new();
        }
        if self.config.is_pass_through() {
            return self.pass_through(&requests).await;
        }

        let keys: Vec<CacheKey> = requests.iter().map(ReadRequest::effective_cache_key).collect();
        let lookups = join_all(
            keys.iter()
                .map(|key| self.lookup::<Vec<Document>>(key, "batch_read")),
        )
        .await;

        let mut outcomes: Vec<Option<ReadOutcome>> = (0..requests.len()).map(|_| None).collect();
        let mut stale: Vec<Option<CacheRead<Vec<Document>>>> =
            (0..requests.len()).map(|_| None).collect();
        let mut missed = Vec::new();

        for (i, lookup) in lookups.into_iter().enumerate() {
            match lookup {
                Cached::Fresh(read) => {
                    self.served_from_cache(&requests[i].collection, read.value().len());
                    outcomes[i] = Some(Ok(read));
                }
                Cached::Stale(read) => {
                    stale[i] = Some(read);
                    missed.push(i);
                }
                Cached::Miss => missed.push(i),
            }
        }
        OptimizerMetrics::add(&self.metrics.cache_misses, missed.len());

        let calls = self.plan_calls(&requests, &missed);
        let in_flight: Vec<InFlight> = calls
            .iter()
            .map(|call| self.spawn_call(&call.collection, call.kind.clone()))
            .collect();
        let collections: Vec<String> = calls.iter().map(|c| c.collection.clone()).collect();

        let mut serving: Vec<Vec<usize>> = vec![Vec::new(); requests.len()];
        for (c, call) in calls.iter().enumerate() {
            for &i in &call.serves {
                serving[i].push(c);
            }
        }

        let pending: Vec<(CacheKey, Duration, ReadTarget, Vec<usize>)> = missed
            .iter()
            .map(|&i| {
                (
                    keys[i].clone(),
                    self.ttl(requests[i].data_type),
                    requests[i].target.clone(),
                    serving[i].clone(),
                )
            })
            .collect();
        let population = self.spawn_population(&in_flight, move |results| {
            pending
                .into_iter()
                .filter_map(|(key, ttl, target, serving)| {
                    let documents = resolve_request(&target, &serving, results).ok()?;
                    let value = cacheable(&key, &documents)?;
                    Some((key, value, ttl))
                })
                .collect()
        });

        let results = self.await_all(&in_flight, &collections).await;
        let fetched_at = self.cache.clock().now();
        for &i in &missed {
            let resolved = resolve_request(&requests[i].target, &serving[i], &results);
            outcomes[i] = Some(match resolved {
                Ok(documents) => {
                    OptimizerMetrics::add(&self.metrics.naive_reads, documents.len());
                    Ok(CacheRead::from_remote(documents, fetched_at))
                }
                Err(e) => self.fail_or_stale(e, stale[i].take()),
            });
        }
        self.settle(population, &results).await;

        debug!(
            requests = requests.len(),
            missed = missed.len(),
            remote_calls = calls.len(),
            "Batch read resolved"
        );

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err(TallyError::from(RemoteError::Other {
                reason: "request was not resolved".to_string(),
            }))))
            .collect()
    }

    /// Unoptimized reads: no cache traffic, no sharing between requests. Id
    /// lists longer than `max_batch_size` still go out in chunks.
    async fn pass_through(&self, requests: &[ReadRequest]) -> Vec<ReadOutcome> {
        let mut in_flight = Vec::new();
        let mut collections = Vec::new();
        let mut serving: Vec<Vec<usize>> = Vec::with_capacity(requests.len());

        for request in requests {
            let kinds = match &request.target {
                ReadTarget::Ids(ids) => unique_ids(ids)
                    .chunks(self.config.max_batch_size)
                    .map(|chunk| CallKind::Ids(chunk.to_vec()))
                    .collect(),
                ReadTarget::Query(query) => vec![CallKind::Query(query.clone())],
            };
            let mut calls = Vec::with_capacity(kinds.len());
            for kind in kinds {
                calls.push(in_flight.len());
                in_flight.push(self.spawn_call(&request.collection, kind));
                collections.push(request.collection.clone());
            }
            serving.push(calls);
        }

        let results = self.await_all(&in_flight, &collections).await;
        let fetched_at = self.cache.clock().now();
        requests
            .iter()
            .zip(&serving)
            .map(|(request, serving)| -> ReadOutcome {
                let documents = resolve_request(&request.target, serving, &results)?;
                OptimizerMetrics::add(&self.metrics.naive_reads, documents.len());
                Ok(CacheRead::from_remote(documents, fetched_at))
            })
            .collect()
    }

    /// Read one document.
    pub async fn get_document(&self, collection: &str, id: &str) -> TallyResult<Option<Document>> {
        let mut outcomes = self
            .batch_read(vec![ReadRequest::document(collection, id)])
            .await;
        match outcomes.pop() {
            Some(outcome) => Ok(outcome?.into_value().into_iter().next()),
            None => Ok(None),
        }
    }

    /// Run one query through the cache.
    pub async fn query(&self, query: Query) -> ReadOutcome {
        let mut outcomes = self.consolidate_query(vec![query], None).await;
        outcomes.pop().unwrap_or_else(|| {
            Err(TallyError::from(RemoteError::Other {
                reason: "query was not resolved".to_string(),
            }))
        })
    }

    // ------------------------------------------------------------------------
    // consolidate_query
    // ------------------------------------------------------------------------

    /// Run several queries, merging compatible ones into compound queries.
    ///
    /// With `cache_key` the whole result set is cached under that key and
    /// served together. Without it every query is cached under its own
    /// fingerprint and only the missed ones are sent to the store.
    pub async fn consolidate_query(
        &self,
        queries: Vec<Query>,
        cache_key: Option<CacheKey>,
    ) -> Vec<ReadOutcome> {
        OptimizerMetrics::add(&self.metrics.total_queries, queries.len());
        if queries.is_empty() {
            return Vec::new();
        }
        if self.config.is_pass_through() {
            let requests: Vec<ReadRequest> = queries.into_iter().map(ReadRequest::query).collect();
            return self.pass_through(&requests).await;
        }

        match cache_key {
            Some(key) => self.consolidate_as_set(&queries, &key).await,
            None => self.consolidate_each(&queries).await,
        }
    }

    async fn consolidate_as_set(&self, queries: &[Query], key: &CacheKey) -> Vec<ReadOutcome> {
        let mut stale: Option<Vec<CacheRead<Vec<Document>>>> = None;
        match self.lookup::<Vec<Vec<Document>>>(key, "consolidate_query").await {
            Cached::Fresh(read) if read.value().len() == queries.len() => {
                let (cached_at, layer) = (read.cached_at(), read.source());
                return read
                    .into_value()
                    .into_iter()
                    .zip(queries)
                    .map(|(documents, query)| {
                        self.served_from_cache(&query.collection, documents.len());
                        Ok(CacheRead::from_cache(documents, cached_at, layer))
                    })
                    .collect();
            }
            Cached::Stale(read) if read.value().len() == queries.len() => {
                let (cached_at, layer) = (read.cached_at(), read.source());
                stale = Some(
                    read.into_value()
                        .into_iter()
                        .map(|documents| CacheRead::stale_fallback(documents, cached_at, layer))
                        .collect(),
                );
            }
            _ => {}
        }
        OptimizerMetrics::add(&self.metrics.cache_misses, queries.len());

        let dispatch = self.dispatch_queries(queries);
        let population = {
            let queries = queries.to_vec();
            let members = dispatch.members.clone();
            let key = key.clone();
            let ttl = self.ttl(None);
            self.spawn_population(&dispatch.calls, move |results| {
                let sets: Result<Vec<Vec<Document>>, RemoteError> =
                    route_results(&queries, members.as_deref(), results)
                        .into_iter()
                        .collect();
                sets.ok()
                    .and_then(|sets| cacheable(&key, &sets))
                    .map(|value| vec![(key, value, ttl)])
                    .unwrap_or_default()
            })
        };

        let raw = self.await_all(&dispatch.calls, &dispatch.collections).await;
        let results = route_results(queries, dispatch.members.as_deref(), &raw);
        let fetched_at = self.cache.clock().now();

        let mut stale = stale.map(|s| s.into_iter().map(Some).collect::<Vec<_>>());
        let outcomes: Vec<ReadOutcome> = results
            .into_iter()
            .enumerate()
            .map(|(i, result)| match result {
                Ok(documents) => {
                    OptimizerMetrics::add(&self.metrics.naive_reads, documents.len());
                    Ok(CacheRead::from_remote(documents, fetched_at))
                }
                Err(e) => {
                    let fallback = stale.as_mut().and_then(|s| s[i].take());
                    self.fail_or_stale(e, fallback)
                }
            })
            .collect();
        self.settle(population, &raw).await;
        outcomes
    }

    async fn consolidate_each(&self, queries: &[Query]) -> Vec<ReadOutcome> {
        let keys: Vec<CacheKey> = queries
            .iter()
            .map(|q| CacheKey::query(&q.collection, &q.fingerprint()))
            .collect();
        let lookups = join_all(
            keys.iter()
                .map(|key| self.lookup::<Vec<Document>>(key, "consolidate_query")),
        )
        .await;

        let mut outcomes: Vec<Option<ReadOutcome>> = (0..queries.len()).map(|_| None).collect();
        let mut stale: Vec<Option<CacheRead<Vec<Document>>>> =
            (0..queries.len()).map(|_| None).collect();
        let mut missed = Vec::new();
        for (i, lookup) in lookups.into_iter().enumerate() {
            match lookup {
                Cached::Fresh(read) => {
                    self.served_from_cache(&queries[i].collection, read.value().len());
                    outcomes[i] = Some(Ok(read));
                }
                Cached::Stale(read) => {
                    stale[i] = Some(read);
                    missed.push(i);
                }
                Cached::Miss => missed.push(i),
            }
        }
        OptimizerMetrics::add(&self.metrics.cache_misses, missed.len());

        let pending: Vec<Query> = missed.iter().map(|&i| queries[i].clone()).collect();
        let dispatch = self.dispatch_queries(&pending);
        let population = {
            let pending = pending.clone();
            let members = dispatch.members.clone();
            let keys: Vec<CacheKey> = missed.iter().map(|&i| keys[i].clone()).collect();
            let ttl = self.ttl(None);
            self.spawn_population(&dispatch.calls, move |results| {
                route_results(&pending, members.as_deref(), results)
                    .into_iter()
                    .zip(keys)
                    .filter_map(|(result, key)| {
                        let value = cacheable(&key, &result.ok()?)?;
                        Some((key, value, ttl))
                    })
                    .collect()
            })
        };

        let raw = self.await_all(&dispatch.calls, &dispatch.collections).await;
        let results = route_results(&pending, dispatch.members.as_deref(), &raw);
        let fetched_at = self.cache.clock().now();

        for (&i, result) in missed.iter().zip(results) {
            outcomes[i] = Some(match result {
                Ok(documents) => {
                    OptimizerMetrics::add(&self.metrics.naive_reads, documents.len());
                    Ok(CacheRead::from_remote(documents, fetched_at))
                }
                Err(e) => self.fail_or_stale(e, stale[i].take()),
            });
        }
        self.settle(population, &raw).await;

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err(TallyError::from(RemoteError::Other {
                reason: "query was not resolved".to_string(),
            }))))
            .collect()
    }

    /// Send queries to the store, merged when the configuration and the
    /// store allow it.
    fn dispatch_queries(&self, queries: &[Query]) -> QueryDispatch {
        let plan = if self.config.enable_query_consolidation
            && self.store.supports_compound_predicates()
        {
            plan_consolidation(
                queries,
                self.config.max_batch_size,
                self.config.enable_composite_indexes,
            )
        } else {
            None
        };

        let (sent, members) = match plan {
            Some(plan) => {
                OptimizerMetrics::add(&self.metrics.queries_merged, plan.calls_saved());
                debug!(
                    field = %plan.field,
                    queries = queries.len(),
                    merged = plan.merged.len(),
                    "Consolidating queries"
                );
                (plan.merged, Some(plan.members))
            }
            None => (queries.to_vec(), None),
        };

        QueryDispatch {
            calls: sent
                .iter()
                .map(|q| self.spawn_call(&q.collection, CallKind::Query(q.clone())))
                .collect(),
            collections: sent.iter().map(|q| q.collection.clone()).collect(),
            members,
        }
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    /// Drop a document, everything derived from it, and every cached query
    /// result of its collection.
    pub async fn invalidate_document(&self, collection: &str, id: &str) -> u64 {
        let removed = self.cache.invalidate(KeyPattern::entity(collection, id)).await;
        removed
            + self
                .cache
                .invalidate(KeyPattern::Prefix(CacheKey::query(collection, "").into_string()))
                .await
    }

    /// Drop every cached key of a collection.
    pub async fn invalidate_collection(&self, collection: &str) -> u64 {
        self.cache.invalidate(KeyPattern::collection(collection)).await
    }
}

/// Count a finished remote call and report it to the tracker.
fn record_call(
    metrics: &OptimizerMetrics,
    tracker: Option<&PerformanceTracker>,
    collection: &str,
    operation: &str,
    elapsed: Duration,
    outcome: &RemoteResult,
) {
    match outcome {
        Ok(documents) => {
            OptimizerMetrics::add(&metrics.total_reads, documents.len());
            if let Some(tracker) = tracker {
                let count = documents.len() as u64;
                tracker.track_read(collection, count, false);
                // Gets are checked per document, lists once per query.
                let evaluations = if operation == "get" { count } else { 1 };
                tracker.track_rule_evaluation(collection, operation, evaluations);
                tracker.track_query_performance(collection, elapsed, documents.len());
            }
        }
        Err(e) => {
            OptimizerMetrics::add(&metrics.remote_failures, 1);
            warn!(collection, operation, error = %e, "Remote read failed");
        }
    }
}

fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    unique
}

fn cacheable<T: serde::Serialize>(key: &CacheKey, value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| warn!(key = %key, error = %e, "Result not cacheable"))
        .ok()
}

/// Result of one request from the calls that served it.
fn resolve_request(
    target: &ReadTarget,
    serving: &[usize],
    results: &[RemoteResult],
) -> RemoteResult {
    match target {
        ReadTarget::Ids(ids) => assemble_ids(ids, serving, results),
        ReadTarget::Query(_) => match serving.first() {
            Some(&c) => results[c].clone(),
            None => Ok(Vec::new()),
        },
    }
}

/// Per-query results from the results of the queries actually sent. Merged
/// results are split back with [`Query::matches`].
fn route_results(
    queries: &[Query],
    members: Option<&[Vec<usize>]>,
    results: &[RemoteResult],
) -> Vec<RemoteResult> {
    let Some(members) = members else {
        return results.to_vec();
    };

    let mut routed: Vec<Option<RemoteResult>> = (0..queries.len()).map(|_| None).collect();
    for (members, merged) in members.iter().zip(results) {
        for &i in members {
            routed[i] = Some(match merged {
                Ok(documents) => Ok(documents
                    .iter()
                    .filter(|doc| queries[i].matches(doc))
                    .cloned()
                    .collect()),
                Err(e) => Err(e.clone()),
            });
        }
    }

    routed
        .into_iter()
        .map(|r| {
            r.unwrap_or_else(|| {
                Err(RemoteError::Other {
                    reason: "query missing from merge plan".to_string(),
                })
            })
        })
        .collect()
}

/// Documents for an id request from the calls that served it, in request order.
fn assemble_ids(ids: &[String], serving: &[usize], results: &[RemoteResult]) -> RemoteResult {
    let mut found: HashMap<&str, &Document> = HashMap::new();
    for &c in serving {
        match &results[c] {
            Ok(documents) => {
                for doc in documents {
                    found.insert(doc.id.as_str(), doc);
                }
            }
            Err(e) => return Err(e.clone()),
        }
    }
    Ok(ids
        .iter()
        .filter_map(|id| found.get(id.as_str()).map(|doc| (*doc).clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_cache_keys() {
        assert_eq!(
            ReadRequest::document("novels", "42").effective_cache_key().as_str(),
            "novels/42"
        );
        assert_eq!(
            ReadRequest::documents("novels", vec!["1".into(), "2".into()])
                .effective_cache_key()
                .as_str(),
            "novels?ids=1:1,1:2"
        );
        let query = Query::collection("novels").where_eq("status", "ongoing");
        assert_eq!(
            ReadRequest::query(query).effective_cache_key().as_str(),
            "novels?status==\"ongoing\""
        );
        assert_eq!(
            ReadRequest::document("novels", "42")
                .with_cache_key("home/featured")
                .effective_cache_key()
                .as_str(),
            "home/featured"
        );
    }

    #[test]
    fn test_id_list_keys_do_not_collide() {
        let key = |ids: &[&str]| {
            ReadRequest::documents("novels", ids.iter().map(|id| id.to_string()).collect())
                .effective_cache_key()
        };
        assert_ne!(key(&["a,b", "c"]), key(&["a", "b,c"]));
        assert_ne!(key(&["a", "b"]), key(&["a,b", ""]));
        assert_eq!(key(&["a", "b"]), key(&["a", "b"]));
    }

    #[test]
    fn test_optimization_ratio() {
        let snapshot = OptimizerSnapshot {
            naive_reads: 20,
            total_reads: 6,
            ..Default::default()
        };
        assert!((snapshot.optimization_ratio() - 0.7).abs() < 1e-9);
        assert_eq!(OptimizerSnapshot::default().optimization_ratio(), 0.0);
    }

    #[test]
    fn test_assemble_ids_keeps_request_order() {
        let results = vec![
            Ok(vec![
                Document::new("b", serde_json::json!({})),
                Document::new("a", serde_json::json!({})),
            ]),
            Err(RemoteError::Other {
                reason: "down".to_string(),
            }),
        ];
        let ids = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let docs = assemble_ids(&ids, &[0], &results).unwrap();
        let order: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);

        assert!(assemble_ids(&ids, &[0, 1], &results).is_err());
    }
}
