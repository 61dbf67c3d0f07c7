//! Tally Monitor - usage tracking and cost alerting
//!
//! Records read and rule-evaluation operations, forwards telemetry to
//! analytics sinks, evaluates cost thresholds and runs the periodic cost
//! monitor.

pub mod alerts;
pub mod jobs;
pub mod report;
pub mod sink;
pub mod tracer;
pub mod tracker;

pub use alerts::{
    AlertEngine, CostMetric, SubscriptionId, DEFAULT_MAX_RETAINED_ALERTS, HISTORY_WINDOW,
    SPIKE_BASELINE_SAMPLES,
};
pub use jobs::{cost_monitor_task, run_cost_check, CostMonitorMetrics, CostMonitorSnapshot};
pub use report::{CostReport, ReportSummary, REPORT_ALERT_WINDOW};
pub use sink::{event_names, AnalyticsSink, PrometheusSink, TelemetryEvent, TracingSink};
pub use tracer::{init_tracing, TelemetryConfig};
pub use tracker::{PerformanceTracker, UsageCounts, DEFAULT_MAX_RECORDS, DEFAULT_RETENTION};
