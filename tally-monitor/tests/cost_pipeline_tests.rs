//! End-to-end tests: tracked operations flow into cost alerts and reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use tally_core::{
    AlertSeverity, AlertType, CostModel, CostThresholds, ManualClock, MonitorConfig,
    PricingTable, SessionId, Timeframe,
};
use tally_monitor::{
    event_names, run_cost_check, AlertEngine, CostReport, PerformanceTracker, PrometheusSink,
};
use tally_test_utils::generators::{arb_cost_thresholds, arb_usage_snapshot};
use tally_test_utils::{FailingSink, RecordingSink};

fn model() -> CostModel {
    CostModel::new(PricingTable::factory_default())
}

#[test]
fn test_tracking_survives_broken_sinks() {
    let recording = Arc::new(RecordingSink::new());
    let tracker = PerformanceTracker::new(SessionId::generate())
        .with_sink(Arc::new(FailingSink::new()))
        .with_sink(Arc::new(FailingSink::panicking()))
        .with_sink(recording.clone());

    tracker.track_read("novels", 20, false);
    tracker.track_rule_evaluation("novels", "get", 20);
    tracker.track_cache_performance("batch_read", true, Duration::from_micros(40));
    tracker.track_user_interaction("open_novel", "novels/n1");

    assert_eq!(recording.events().len(), 4);
    assert_eq!(tracker.sink_failures(), 8);
    assert_eq!(tracker.usage_over(Duration::from_secs(60)).billed_reads, 20);
}

#[test]
fn test_prometheus_sink_receives_tracked_events() {
    let prometheus = Arc::new(PrometheusSink::new().unwrap());
    let tracker = PerformanceTracker::new(SessionId::generate()).with_sink(prometheus.clone());

    tracker.track_read("chapters", 7, true);
    tracker.track_query_performance("chapters", Duration::from_millis(12), 7);

    let text = prometheus.gather_text().unwrap();
    assert!(text.contains("tally_documents_read_total"));
    assert!(text.contains("tally_query_duration_seconds"));
    assert_eq!(
        prometheus
            .documents_read_total
            .with_label_values(&["chapters", "true"])
            .get(),
        7.0
    );
}

#[test]
fn test_heavy_day_raises_alerts_and_notifies() {
    let tracker = PerformanceTracker::new(SessionId::generate());
    let engine = AlertEngine::new(CostThresholds::factory_default()).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    engine.subscribe_to_alerts(move |alert| sink.lock().unwrap().push(alert.alert_type));

    // 20M billed reads/day: (20M - 50k) / 100k * 0.036 * 30 = 215.46/month.
    tracker.track_read("novels", 20_000_000, false);
    let alerts = run_cost_check(&tracker, &engine, &model(), &MonitorConfig::default()).unwrap();

    let types: Vec<AlertType> = alerts.iter().map(|a| a.alert_type).collect();
    assert_eq!(
        types,
        vec![
            AlertType::DailyBudget,
            AlertType::MonthlyProjection,
            AlertType::ReadOperations
        ]
    );
    assert_eq!(*received.lock().unwrap(), types);
}

#[test]
fn test_spike_after_a_quiet_week() {
    let clock = Arc::new(ManualClock::starting_now());
    let tracker = PerformanceTracker::new(SessionId::generate()).with_clock(clock.clone());
    let engine = AlertEngine::new(CostThresholds::factory_default())
        .unwrap()
        .with_clock(clock.clone());
    let config = MonitorConfig::default();

    for _ in 0..7 {
        tracker.track_read("novels", 1_050_000, false);
        run_cost_check(&tracker, &engine, &model(), &config).unwrap();
        clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
    }

    tracker.track_read("novels", 3_050_000, false);
    let alerts = run_cost_check(&tracker, &engine, &model(), &config).unwrap();

    let spike = alerts
        .iter()
        .find(|a| a.alert_type == AlertType::CostSpike)
        .expect("spike alert");
    assert_eq!(spike.severity, AlertSeverity::Critical);
    assert!((spike.current_value - 200.0).abs() < 1e-6);
}

#[test]
fn test_failing_subscriber_does_not_block_delivery() {
    let engine = AlertEngine::new(CostThresholds::factory_default()).unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));

    let first = delivered.clone();
    engine.subscribe_to_alerts(move |_| {
        first.fetch_add(1, Ordering::SeqCst);
    });
    engine.subscribe_to_alerts(|alert| panic!("cannot handle {:?}", alert.alert_type));
    let last = delivered.clone();
    engine.subscribe_to_alerts(move |_| {
        last.fetch_add(1, Ordering::SeqCst);
    });

    let breakdown = model().calculate_cost_breakdown(0, 0, 0.0, 40.0, Timeframe::Daily);
    let alerts = engine.monitor_cost_thresholds(&breakdown);
    assert_eq!(delivered.load(Ordering::SeqCst), alerts.len() * 2);
}

#[test]
fn test_report_includes_only_recent_alerts() {
    let clock = Arc::new(ManualClock::starting_now());
    let engine = AlertEngine::new(CostThresholds::factory_default())
        .unwrap()
        .with_clock(clock.clone());
    let model = model();

    let heavy = model.calculate_cost_breakdown(0, 0, 0.0, 40.0, Timeframe::Daily);
    engine.monitor_cost_thresholds(&heavy);
    clock.advance(Duration::from_secs(25 * 60 * 60));

    let quiet = model.calculate_cost_breakdown(1_000, 100, 0.2, 0.1, Timeframe::Daily);
    let report = CostReport::build(&model, quiet, &engine, Utc::now());
    assert!(report.alerts.is_empty());
    assert_eq!(report.summary.total_daily_cost, 0.0);

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["alerts"], serde_json::json!([]));
}

#[test]
fn test_events_are_named_consistently() {
    let sink = Arc::new(RecordingSink::new());
    let tracker = PerformanceTracker::new(SessionId::generate()).with_sink(sink.clone());

    tracker.track_read("novels", 1, true);
    tracker.record_custom_metric("bookmarks_added", 3.0, Default::default());

    assert_eq!(sink.events_named(event_names::DOCUMENT_READ).len(), 1);
    assert_eq!(sink.events_named("bookmarks_added")[0].value, 3.0);
}

proptest! {
    #[test]
    fn prop_repeated_monitoring_is_stable(
        usage in arb_usage_snapshot(),
        thresholds in arb_cost_thresholds(),
    ) {
        let engine = AlertEngine::new(thresholds).unwrap();
        let breakdown = model().breakdown_for(&usage, Timeframe::Daily);

        let first = engine.monitor_cost_thresholds(&breakdown);
        let second = engine.monitor_cost_thresholds(&breakdown);

        prop_assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            prop_assert!(a.same_crossing(b));
        }
    }
}
