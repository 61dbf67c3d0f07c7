//! Performance tracker
//!
//! Records read and rule-evaluation operations for cost aggregation and
//! forwards every measurement to the configured analytics sinks. Tracking
//! never fails the measured operation: sink errors and panics are logged,
//! counted and dropped.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tally_core::{
    Clock, ReadOperationRecord, RuleEvaluationRecord, SessionId, SystemClock, Timestamp,
    UsageSnapshot,
};

use crate::sink::{event_names, AnalyticsSink, TelemetryEvent};

/// Operation records older than this are dropped.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Records kept per operation kind. The oldest are dropped beyond this.
pub const DEFAULT_MAX_RECORDS: usize = 100_000;

trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

impl Timestamped for ReadOperationRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for RuleEvaluationRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Pop records before `cutoff` from the front. Returns how many went.
fn drop_before<T: Timestamped>(records: &mut VecDeque<T>, cutoff: Timestamp) -> usize {
    let mut dropped = 0;
    while records.front().is_some_and(|r| r.timestamp() < cutoff) {
        records.pop_front();
        dropped += 1;
    }
    dropped
}

/// Aggregated operation counts over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts {
    /// Documents fetched from the remote store (billed).
    pub billed_reads: u64,
    /// Documents served from cache (not billed).
    pub cached_reads: u64,
    pub rule_evaluations: u64,
}

impl UsageCounts {
    /// Usage snapshot for the cost model. Storage and bandwidth are not
    /// observable from reads and come from the caller.
    pub fn to_snapshot(&self, storage_gb: f64, bandwidth_gb: f64) -> UsageSnapshot {
        UsageSnapshot {
            reads: self.billed_reads,
            rule_evaluations: self.rule_evaluations,
            storage_gb,
            bandwidth_gb,
        }
    }
}

/// Records operations and emits telemetry for one session.
pub struct PerformanceTracker {
    session_id: SessionId,
    sinks: Vec<Arc<dyn AnalyticsSink>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    max_records: usize,
    reads: RwLock<VecDeque<ReadOperationRecord>>,
    rule_evaluations: RwLock<VecDeque<RuleEvaluationRecord>>,
    sink_failures: AtomicU64,
    records_evicted: AtomicU64,
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("session_id", &self.session_id)
            .field("sinks", &self.sinks.len())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl PerformanceTracker {
    /// Create a tracker for one session with no sinks.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            sinks: Vec::new(),
            clock: Arc::new(SystemClock),
            retention: DEFAULT_RETENTION,
            max_records: DEFAULT_MAX_RECORDS,
            reads: RwLock::new(VecDeque::new()),
            rule_evaluations: RwLock::new(VecDeque::new()),
            sink_failures: AtomicU64::new(0),
            records_evicted: AtomicU64::new(0),
        }
    }

    /// Add an analytics sink.
    pub fn with_sink(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Cap on records kept per operation kind (minimum 1).
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max.max(1);
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Records dropped because the per-kind cap was reached.
    pub fn records_evicted(&self) -> u64 {
        self.records_evicted.load(Ordering::Relaxed)
    }

    /// Number of sink deliveries that failed or panicked.
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    fn event(&self, name: &str, value: f64) -> TelemetryEvent {
        TelemetryEvent::new(name, value, self.clock.now(), self.session_id)
    }

    fn emit(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink.record(&event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "sink panicked".to_string(),
            };
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                sink = sink.name(),
                event = %event.name,
                error = %failure,
                "Analytics sink failed, event dropped"
            );
        }
    }

    /// Append a record, dropping what fell out of retention and then the
    /// oldest records over the cap.
    fn append<T: Timestamped>(&self, records: &RwLock<VecDeque<T>>, record: T) {
        let cutoff = self.cutoff();
        if let Ok(mut records) = records.write() {
            drop_before(&mut records, cutoff);
            records.push_back(record);
            let excess = records.len().saturating_sub(self.max_records);
            if excess > 0 {
                records.drain(..excess);
                let total = self.records_evicted.fetch_add(excess as u64, Ordering::Relaxed);
                if total == 0 {
                    tracing::warn!(
                        max_records = self.max_records,
                        "Operation record cap reached, oldest records are being dropped"
                    );
                }
            }
        }
    }

    /// Record a document read. `document_count` documents were returned,
    /// served from cache when `cache_hit` is true.
    pub fn track_read(&self, collection: &str, document_count: u64, cache_hit: bool) {
        let record = ReadOperationRecord {
            collection: collection.to_string(),
            document_count,
            timestamp: self.clock.now(),
            cache_hit,
        };
        self.append(&self.reads, record);

        self.emit(
            self.event(event_names::DOCUMENT_READ, document_count as f64)
                .with_attribute("collection", collection)
                .with_attribute("cache_hit", cache_hit),
        );
    }

    /// Record server-side rule evaluations.
    pub fn track_rule_evaluation(&self, collection: &str, operation: &str, evaluation_count: u64) {
        let record = RuleEvaluationRecord {
            collection: collection.to_string(),
            operation: operation.to_string(),
            evaluation_count,
            timestamp: self.clock.now(),
        };
        self.append(&self.rule_evaluations, record);

        self.emit(
            self.event(event_names::RULE_EVALUATION, evaluation_count as f64)
                .with_attribute("collection", collection)
                .with_attribute("operation", operation),
        );
    }

    /// Record the outcome of one cache lookup.
    pub fn track_cache_performance(&self, operation: &str, hit: bool, duration: Duration) {
        let outcome = if hit { "hit" } else { "miss" };
        self.emit(
            self.event(event_names::CACHE_PERFORMANCE, duration.as_secs_f64())
                .with_attribute("operation", operation)
                .with_attribute("outcome", outcome),
        );
    }

    /// Record the duration of one remote query.
    pub fn track_query_performance(
        &self,
        collection: &str,
        duration: Duration,
        result_count: usize,
    ) {
        self.emit(
            self.event(event_names::QUERY_PERFORMANCE, duration.as_secs_f64())
                .with_attribute("collection", collection)
                .with_attribute("result_count", result_count),
        );
    }

    /// Record a user interaction such as opening a chapter.
    pub fn track_user_interaction(&self, action: &str, target: &str) {
        self.emit(
            self.event(event_names::USER_INTERACTION, 1.0)
                .with_attribute("action", action)
                .with_attribute("target", target),
        );
    }

    /// Record an arbitrary named metric.
    pub fn record_custom_metric(
        &self,
        name: &str,
        value: f64,
        attributes: BTreeMap<String, String>,
    ) {
        let mut event = self.event(name, value);
        event.attributes = attributes;
        self.emit(event);
    }

    /// Drop records older than the retention window. Returns how many went.
    pub fn prune(&self) -> usize {
        let cutoff = self.cutoff();
        let mut dropped = 0;
        if let Ok(mut reads) = self.reads.write() {
            dropped += drop_before(&mut reads, cutoff);
        }
        if let Ok(mut evaluations) = self.rule_evaluations.write() {
            dropped += drop_before(&mut evaluations, cutoff);
        }
        dropped
    }

    fn cutoff(&self) -> Timestamp {
        let retention = ChronoDuration::from_std(self.retention).unwrap_or(ChronoDuration::MAX);
        self.clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(Timestamp::MIN_UTC)
    }

    /// Aggregate operations recorded at or after `since` within retention.
    pub fn usage_since(&self, since: Timestamp) -> UsageCounts {
        let since = since.max(self.cutoff());
        let mut counts = UsageCounts::default();

        if let Ok(reads) = self.reads.read() {
            for record in reads.iter().filter(|r| r.timestamp >= since) {
                if record.cache_hit {
                    counts.cached_reads += record.document_count;
                } else {
                    counts.billed_reads += record.document_count;
                }
            }
        }
        if let Ok(evaluations) = self.rule_evaluations.read() {
            counts.rule_evaluations = evaluations
                .iter()
                .filter(|r| r.timestamp >= since)
                .map(|r| r.evaluation_count)
                .sum();
        }
        counts
    }

    /// Usage over the last `window`.
    pub fn usage_over(&self, window: Duration) -> UsageCounts {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        let since = self
            .clock
            .now()
            .checked_sub_signed(window)
            .unwrap_or(Timestamp::MIN_UTC);
        self.usage_since(since)
    }

    /// Snapshot of the retained read records, oldest first.
    pub fn read_records(&self) -> Vec<ReadOperationRecord> {
        let cutoff = self.cutoff();
        self.reads
            .read()
            .map(|reads| reads.iter().filter(|r| r.timestamp >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the retained rule-evaluation records, oldest first.
    pub fn rule_evaluation_records(&self) -> Vec<RuleEvaluationRecord> {
        let cutoff = self.cutoff();
        self.rule_evaluations
            .read()
            .map(|evals| evals.iter().filter(|r| r.timestamp >= cutoff).cloned().collect())
            .unwrap_or_default()
    }
}
