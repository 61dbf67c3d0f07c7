//! Tally Test Utilities
//!
//! Centralized test infrastructure for the Tally workspace:
//! - A scriptable in-memory remote document store
//! - Recording and failing analytics sinks
//! - Proptest generators for usage, thresholds, keys and documents
//! - Fixtures for common scenarios
//! - Custom assertions on read outcomes

// Re-export core types for convenience
pub use tally_core::{
    CacheConfig, CostThresholds, DataType, ManualClock, OptimizationConfig, RemoteError,
    SessionId, TallyError, TallyResult, TelemetryError, Timestamp, UsageSnapshot,
};
pub use tally_monitor::{AnalyticsSink, TelemetryEvent};
pub use tally_query::{Document, Query, RemoteStore};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

// ============================================================================
// MOCK REMOTE STORE
// ============================================================================

/// One call received by [`MockRemoteStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Fetch { collection: String, ids: Vec<String> },
    Query(Query),
}

/// In-memory document store that counts calls and can be told to fail or
/// stall.
#[derive(Debug, Default)]
pub struct MockRemoteStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    calls: Mutex<Vec<RecordedCall>>,
    documents_read: AtomicU64,
    failing: RwLock<HashMap<String, RemoteError>>,
    delay: RwLock<Option<Duration>>,
    no_compound: std::sync::atomic::AtomicBool,
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub fn insert(&self, collection: &str, doc: Document) {
        let mut collections = self.collections.write().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        docs.retain(|d| d.id != doc.id);
        docs.push(doc);
    }

    pub fn with_documents(
        self,
        collection: &str,
        docs: impl IntoIterator<Item = Document>,
    ) -> Self {
        for doc in docs {
            self.insert(collection, doc);
        }
        self
    }

    /// Every call on `collection` fails with `error` until [`Self::heal`].
    pub fn fail_collection(&self, collection: &str, error: RemoteError) {
        self.failing
            .write()
            .unwrap()
            .insert(collection.to_string(), error);
    }

    pub fn heal(&self, collection: &str) {
        self.failing.write().unwrap().remove(collection);
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().unwrap() = delay;
    }

    pub fn set_compound_predicates(&self, supported: bool) {
        self.no_compound.store(!supported, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Documents returned across all calls (the billed reads).
    pub fn documents_read(&self) -> u64 {
        self.documents_read.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.calls.lock().unwrap().clear();
        self.documents_read.store(0, Ordering::SeqCst);
    }

    async fn enter(&self, collection: &str, call: RecordedCall) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        let delay = *self.delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failing.read().unwrap().get(collection) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn read(&self, docs: Vec<Document>) -> Vec<Document> {
        self.documents_read
            .fetch_add(docs.len() as u64, Ordering::SeqCst);
        docs
    }
}

#[async_trait]
impl RemoteStore for MockRemoteStore {
    async fn fetch_documents(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<Document>, RemoteError> {
        self.enter(
            collection,
            RecordedCall::Fetch {
                collection: collection.to_string(),
                ids: ids.to_vec(),
            },
        )
        .await?;

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let docs = self
            .collections
            .read()
            .unwrap()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| wanted.contains(d.id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(self.read(docs))
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        self.enter(&query.collection, RecordedCall::Query(query.clone()))
            .await?;

        let mut docs: Vec<Document> = self
            .collections
            .read()
            .unwrap()
            .get(&query.collection)
            .map(|docs| docs.iter().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &query.order_by {
            docs.sort_by(|a, b| {
                let ordering = compare_field(a, b, &order.field);
                match order.direction {
                    tally_query::SortDirection::Ascending => ordering,
                    tally_query::SortDirection::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(self.read(docs))
    }

    fn supports_compound_predicates(&self) -> bool {
        !self.no_compound.load(Ordering::SeqCst)
    }
}

fn compare_field(a: &Document, b: &Document, field: &str) -> std::cmp::Ordering {
    let (x, y) = (a.field(field), b.field(field));
    match (x.and_then(|v| v.as_f64()), y.and_then(|v| v.as_f64())) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => x
            .map(|v| v.to_string())
            .cmp(&y.map(|v| v.to_string())),
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

impl AnalyticsSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Rejects every event, or panics when built with [`FailingSink::panicking`].
#[derive(Debug, Default)]
pub struct FailingSink {
    panics: bool,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn panicking() -> Self {
        Self { panics: true }
    }
}

impl AnalyticsSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if self.panics {
            panic!("analytics backend crashed on {}", event.name);
        }
        Err(TelemetryError::SinkFailed {
            sink: "failing".to_string(),
            event: event.name.clone(),
            reason: "backend unreachable".to_string(),
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tally types.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    /// Generate a Timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_collection() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("novels".to_string()),
            Just("chapters".to_string()),
            Just("reviews".to_string()),
            Just("users".to_string()),
        ]
    }

    pub fn arb_document_id() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,12}"
    }

    pub fn arb_data_type() -> impl Strategy<Value = DataType> {
        prop_oneof![
            Just(DataType::Novel),
            Just(DataType::Chapter),
            Just(DataType::UserProfile),
            Just(DataType::Review),
            Just(DataType::Comment),
            Just(DataType::Stats),
            Just(DataType::Notification),
            Just(DataType::Static),
        ]
    }

    /// Small JSON values of mixed shape.
    pub fn arb_json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z ]{0,24}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    pub fn arb_document() -> impl Strategy<Value = Document> {
        (arb_document_id(), arb_json_value()).prop_map(|(id, data)| Document::new(id, data))
    }

    /// Daily usage between idle and heavy.
    pub fn arb_usage_snapshot() -> impl Strategy<Value = UsageSnapshot> {
        (0u64..5_000_000, 0u64..2_000_000, 0.0f64..50.0, 0.0f64..50.0).prop_map(
            |(reads, rule_evaluations, storage_gb, bandwidth_gb)| UsageSnapshot {
                reads,
                rule_evaluations,
                storage_gb,
                bandwidth_gb,
            },
        )
    }

    /// Thresholds that pass validation.
    pub fn arb_cost_thresholds() -> impl Strategy<Value = CostThresholds> {
        (
            0.5f64..50.0,
            10.0f64..1000.0,
            (1.0f64..100.0, 1.0f64..100.0, 1.0f64..100.0, 1.0f64..100.0),
            1.0f64..300.0,
        )
            .prop_map(
                |(daily, monthly, (reads, rules, storage, bandwidth), spike)| CostThresholds {
                    daily_budget: daily,
                    monthly_budget: monthly,
                    read_operations_cost_threshold: reads,
                    rule_evaluations_cost_threshold: rules,
                    storage_cost_threshold: storage,
                    bandwidth_cost_threshold: bandwidth,
                    cost_spike_percentage: spike,
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tally_storage::CacheManager;

    pub fn novel(id: &str, author: &str) -> Document {
        Document::new(
            id,
            json!({ "title": format!("Novel {id}"), "authorId": author, "status": "ongoing" }),
        )
    }

    pub fn chapter(id: &str, novel_id: &str, number: i64) -> Document {
        Document::new(
            id,
            json!({ "novelId": novel_id, "number": number, "published": true }),
        )
    }

    /// `novels` n0..n{count} (alternating between two authors) plus three
    /// published chapters per novel in `chapters`.
    pub fn seeded_store(count: usize) -> MockRemoteStore {
        let store = MockRemoteStore::new();
        for n in 0..count {
            let novel_id = format!("n{n}");
            let author = if n % 2 == 0 { "a0" } else { "a1" };
            store.insert("novels", novel(&novel_id, author));
            for c in 1..=3 {
                store.insert("chapters", chapter(&format!("{novel_id}-c{c}"), &novel_id, c));
            }
        }
        store
    }

    /// Memory-only cache driven by a manual clock.
    pub fn test_cache(clock: Arc<ManualClock>) -> Arc<CacheManager> {
        let cache = CacheManager::in_memory(CacheConfig::default())
            .expect("default cache config is valid")
            .with_clock(clock);
        Arc::new(cache)
    }

    /// Optimizer config with a short remote timeout.
    pub fn fast_config() -> OptimizationConfig {
        OptimizationConfig {
            remote_timeout_ms: 50,
            ..OptimizationConfig::default()
        }
    }

    pub fn ids(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{prefix}{i}")).collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on read outcomes.

    use super::*;
    use tally_core::CacheLayerKind;
    use tally_query::ReadOutcome;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TallyResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &TallyResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert the outcome was served fresh from a cache layer.
    #[track_caller]
    pub fn assert_cache_hit(outcome: &ReadOutcome) {
        match outcome {
            Ok(read) => assert!(read.is_cache_hit(), "Expected cache hit, got {:?}", read.source()),
            Err(e) => panic!("Expected cache hit, got error: {e}"),
        }
    }

    /// Assert the outcome was fetched from the remote store.
    #[track_caller]
    pub fn assert_remote(outcome: &ReadOutcome) {
        match outcome {
            Ok(read) => assert_eq!(read.source(), CacheLayerKind::Remote),
            Err(e) => panic!("Expected remote read, got error: {e}"),
        }
    }

    /// Assert the outcome is an expired value served after a failure.
    #[track_caller]
    pub fn assert_stale(outcome: &ReadOutcome) {
        match outcome {
            Ok(read) => assert!(read.is_stale(), "Expected stale value, got fresh"),
            Err(e) => panic!("Expected stale value, got error: {e}"),
        }
    }

    #[track_caller]
    pub fn assert_timeout(outcome: &ReadOutcome) {
        match outcome {
            Err(e) => assert!(e.is_timeout(), "Expected timeout, got: {e}"),
            Ok(read) => panic!("Expected timeout, got value from {:?}", read.source()),
        }
    }

    /// Document ids of a successful outcome, in order.
    #[track_caller]
    pub fn doc_ids(outcome: &ReadOutcome) -> Vec<String> {
        match outcome {
            Ok(read) => read.value().iter().map(|d| d.id.clone()).collect(),
            Err(e) => panic!("Expected documents, got error: {e}"),
        }
    }
}
