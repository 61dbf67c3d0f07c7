//! Analytics sinks
//!
//! A sink receives named, timestamped telemetry events with a flat string
//! attribute map. Delivery is fire-and-forget: the tracker logs and drops
//! sink errors.

use std::collections::BTreeMap;

use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry,
    register_histogram_vec_with_registry, CounterVec, Encoder, GaugeVec, HistogramVec, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use tally_core::{SessionId, TelemetryError, Timestamp};

/// Event names emitted by the performance tracker.
pub mod event_names {
    pub const DOCUMENT_READ: &str = "document_read";
    pub const RULE_EVALUATION: &str = "rule_evaluation";
    pub const CACHE_PERFORMANCE: &str = "cache_performance";
    pub const QUERY_PERFORMANCE: &str = "query_performance";
    pub const USER_INTERACTION: &str = "user_interaction";
}

/// One telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub name: String,
    pub value: f64,
    pub timestamp: Timestamp,
    pub session_id: SessionId,
    pub attributes: BTreeMap<String, String>,
}

impl TelemetryEvent {
    pub fn new(
        name: impl Into<String>,
        value: f64,
        timestamp: Timestamp,
        session_id: SessionId,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            session_id,
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    /// Attribute value, or `"unknown"` when absent.
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("unknown")
    }
}

/// Destination for telemetry events.
pub trait AnalyticsSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Deliver one event.
    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;
}

// ============================================================================
// TRACING SINK
// ============================================================================

/// Logs every event at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        tracing::debug!(
            event = %event.name,
            value = event.value,
            session_id = %event.session_id,
            attributes = ?event.attributes,
            "Telemetry event"
        );
        Ok(())
    }
}

// ============================================================================
// PROMETHEUS SINK
// ============================================================================

/// Query latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const QUERY_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Translates telemetry events into Prometheus metrics on an owned registry.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Registry,

    /// Documents read - labels: collection, cache_hit
    pub documents_read_total: CounterVec,

    /// Rule evaluations - labels: collection, operation
    pub rule_evaluations_total: CounterVec,

    /// Cache lookups - labels: operation, outcome
    pub cache_lookups_total: CounterVec,

    /// Remote query duration - labels: collection
    pub query_duration_seconds: HistogramVec,

    /// User interactions - labels: action
    pub user_interactions_total: CounterVec,

    /// Last value of each custom metric - labels: name
    pub custom_metrics: GaugeVec,
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

fn registration(metric: &str) -> impl FnOnce(prometheus::Error) -> TelemetryError + '_ {
    move |e| TelemetryError::Registration {
        metric: metric.to_string(),
        reason: e.to_string(),
    }
}

impl PrometheusSink {
    /// Create a sink with its own registry.
    pub fn new() -> Result<Self, TelemetryError> {
        Self::with_registry(Registry::new())
    }

    /// Create a sink registering into `registry`.
    pub fn with_registry(registry: Registry) -> Result<Self, TelemetryError> {
        Ok(Self {
            documents_read_total: register_counter_vec_with_registry!(
                "tally_documents_read_total",
                "Documents read, split by whether the cache served them",
                &["collection", "cache_hit"],
                registry
            )
            .map_err(registration("tally_documents_read_total"))?,

            rule_evaluations_total: register_counter_vec_with_registry!(
                "tally_rule_evaluations_total",
                "Server-side security rule evaluations",
                &["collection", "operation"],
                registry
            )
            .map_err(registration("tally_rule_evaluations_total"))?,

            cache_lookups_total: register_counter_vec_with_registry!(
                "tally_cache_lookups_total",
                "Cache lookups by outcome",
                &["operation", "outcome"],
                registry
            )
            .map_err(registration("tally_cache_lookups_total"))?,

            query_duration_seconds: register_histogram_vec_with_registry!(
                "tally_query_duration_seconds",
                "Remote query duration in seconds",
                &["collection"],
                QUERY_LATENCY_BUCKETS.to_vec(),
                registry
            )
            .map_err(registration("tally_query_duration_seconds"))?,

            user_interactions_total: register_counter_vec_with_registry!(
                "tally_user_interactions_total",
                "User interactions",
                &["action"],
                registry
            )
            .map_err(registration("tally_user_interactions_total"))?,

            custom_metrics: register_gauge_vec_with_registry!(
                "tally_custom_metric",
                "Last recorded value of a custom metric",
                &["name"],
                registry
            )
            .map_err(registration("tally_custom_metric"))?,

            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in Prometheus text format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| TelemetryError::Export {
                reason: e.to_string(),
            })?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Export {
            reason: e.to_string(),
        })
    }
}

impl AnalyticsSink for PrometheusSink {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if !event.value.is_finite() || event.value < 0.0 {
            return Err(TelemetryError::SinkFailed {
                sink: self.name().to_string(),
                event: event.name.clone(),
                reason: format!("value {} cannot be recorded", event.value),
            });
        }

        match event.name.as_str() {
            event_names::DOCUMENT_READ => self
                .documents_read_total
                .with_label_values(&[event.attribute("collection"), event.attribute("cache_hit")])
                .inc_by(event.value),
            event_names::RULE_EVALUATION => self
                .rule_evaluations_total
                .with_label_values(&[event.attribute("collection"), event.attribute("operation")])
                .inc_by(event.value),
            event_names::CACHE_PERFORMANCE => self
                .cache_lookups_total
                .with_label_values(&[event.attribute("operation"), event.attribute("outcome")])
                .inc(),
            event_names::QUERY_PERFORMANCE => self
                .query_duration_seconds
                .with_label_values(&[event.attribute("collection")])
                .observe(event.value),
            event_names::USER_INTERACTION => self
                .user_interactions_total
                .with_label_values(&[event.attribute("action")])
                .inc(),
            other => self.custom_metrics.with_label_values(&[other]).set(event.value),
        }
        Ok(())
    }
}
