//! Cost alert engine
//!
//! Compares a [`CostBreakdown`] against [`CostThresholds`] and against the
//! recent history of daily cost, raising [`CostAlert`]s and fanning them out
//! to subscribers.
//!
//! # Checks, in order
//!
//! 1. Daily budget against `total_daily_cost`
//! 2. Monthly budget against the projected monthly total
//! 3. Per-resource thresholds against each resource's projected monthly cost
//! 4. Spike: the latest daily-cost sample against the average of the seven
//!    samples before it. Needs at least eight samples.
//!
//! History holds one sample per calendar day (UTC, from the engine's clock).
//! Recording again on the same day replaces that day's sample, so a monitor
//! ticking hourly still builds a day-by-day history.
//!
//! Checks only read history. `monitor_cost_thresholds` called twice with the
//! same breakdown and no new sample raises the same crossings both times.
//!
//! # Retention
//!
//! Raised alerts are kept in a bounded ring buffer (oldest dropped) until
//! cleared by id.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate};
use tally_core::{
    AlertId, AlertSeverity, AlertType, Clock, CostAlert, CostBreakdown, CostThresholds,
    SystemClock, TallyConfig, TallyResult, DAYS_PER_MONTH,
};

/// Daily samples kept per metric.
pub const HISTORY_WINDOW: usize = 30;

/// Samples averaged for the spike baseline (today excluded).
pub const SPIKE_BASELINE_SAMPLES: usize = 7;

/// Default capacity of the alert ring buffer.
pub const DEFAULT_MAX_RETAINED_ALERTS: usize = 500;

/// Spike increase (percent) above which a spike is critical.
const CRITICAL_SPIKE_PERCENTAGE: f64 = 100.0;

/// Metric with a rolling history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CostMetric {
    /// Average daily total cost. Drives spike detection.
    TotalDailyCost,
    ReadsCost,
    RuleEvaluationsCost,
    StorageCost,
    BandwidthCost,
}

/// Handle returned by [`AlertEngine::subscribe_to_alerts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type AlertCallback = Arc<dyn Fn(&CostAlert) + Send + Sync>;

/// Threshold and spike detector.
pub struct AlertEngine {
    thresholds: CostThresholds,
    clock: Arc<dyn Clock>,
    max_retained: usize,
    history: RwLock<HashMap<CostMetric, VecDeque<(NaiveDate, f64)>>>,
    alerts: RwLock<VecDeque<CostAlert>>,
    subscribers: RwLock<Vec<(SubscriptionId, AlertCallback)>>,
    next_subscription: AtomicU64,
    subscriber_failures: AtomicU64,
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine")
            .field("thresholds", &self.thresholds)
            .field("max_retained", &self.max_retained)
            .finish_non_exhaustive()
    }
}

impl AlertEngine {
    /// Create an engine. Invalid thresholds fail fast.
    pub fn new(thresholds: CostThresholds) -> TallyResult<Self> {
        thresholds.validate()?;
        Ok(Self {
            thresholds,
            clock: Arc::new(SystemClock),
            max_retained: DEFAULT_MAX_RETAINED_ALERTS,
            history: RwLock::new(HashMap::new()),
            alerts: RwLock::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            subscriber_failures: AtomicU64::new(0),
        })
    }

    /// Create an engine from the thresholds and alert retention of a full
    /// configuration.
    pub fn from_config(config: &TallyConfig) -> TallyResult<Self> {
        config.monitor.validate()?;
        Ok(Self::new(config.thresholds.clone())?
            .with_max_retained_alerts(config.monitor.max_retained_alerts))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Capacity of the alert ring buffer (minimum 1).
    pub fn with_max_retained_alerts(mut self, max: usize) -> Self {
        self.max_retained = max.max(1);
        self
    }

    pub fn thresholds(&self) -> &CostThresholds {
        &self.thresholds
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    /// Record today's sample of a metric, replacing any earlier sample from
    /// the same day.
    pub fn record_sample(&self, metric: CostMetric, value: f64) {
        self.record_daily_sample(metric, self.clock.now().date_naive(), value);
    }

    /// Record the sample of a metric for `day`.
    ///
    /// A sample for the latest recorded day replaces it. Days older than the
    /// latest one are ignored.
    pub fn record_daily_sample(&self, metric: CostMetric, day: NaiveDate, value: f64) {
        if !value.is_finite() {
            tracing::warn!(metric = ?metric, value, "Ignoring non-finite cost sample");
            return;
        }
        if let Ok(mut history) = self.history.write() {
            let samples = history.entry(metric).or_default();
            match samples.back_mut() {
                Some((last_day, last)) if *last_day == day => *last = value,
                Some((last_day, _)) if *last_day > day => {
                    tracing::warn!(
                        metric = ?metric,
                        %day,
                        latest = %last_day,
                        "Ignoring cost sample older than the latest recorded day"
                    );
                }
                _ => samples.push_back((day, value)),
            }
            while samples.len() > HISTORY_WINDOW {
                samples.pop_front();
            }
        }
    }

    /// Daily samples of one metric, oldest first.
    pub fn history(&self, metric: CostMetric) -> Vec<f64> {
        self.history
            .read()
            .ok()
            .and_then(|h| h.get(&metric).map(|s| s.iter().map(|(_, v)| *v).collect()))
            .unwrap_or_default()
    }

    /// Percentage increase of the latest daily cost over the trailing
    /// baseline, or `None` when there is too little history or the baseline
    /// is zero.
    pub fn spike_percentage(&self) -> Option<f64> {
        let samples = self.history(CostMetric::TotalDailyCost);
        if samples.len() < SPIKE_BASELINE_SAMPLES + 1 {
            return None;
        }
        let (today, earlier) = samples.split_last()?;
        let baseline = &earlier[earlier.len() - SPIKE_BASELINE_SAMPLES..];
        let average = baseline.iter().sum::<f64>() / SPIKE_BASELINE_SAMPLES as f64;
        if average <= 0.0 {
            return None;
        }
        Some((today - average) / average * 100.0)
    }

    // ------------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------------

    fn alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        current_value: f64,
        threshold: f64,
        action_required: bool,
        message: String,
    ) -> CostAlert {
        CostAlert {
            id: AlertId::now_v7(),
            alert_type,
            severity,
            current_value,
            threshold,
            timestamp: self.clock.now(),
            action_required,
            message,
        }
    }

    /// Evaluate a breakdown without recording or notifying.
    pub fn evaluate(&self, breakdown: &CostBreakdown) -> Vec<CostAlert> {
        let t = &self.thresholds;
        let mut raised = Vec::new();

        if breakdown.total_daily_cost > t.daily_budget {
            raised.push(self.alert(
                AlertType::DailyBudget,
                AlertSeverity::Warning,
                breakdown.total_daily_cost,
                t.daily_budget,
                true,
                format!(
                    "Daily cost {:.2} exceeds budget {:.2}",
                    breakdown.total_daily_cost, t.daily_budget
                ),
            ));
        }

        if breakdown.total_cost > t.monthly_budget {
            raised.push(self.alert(
                AlertType::MonthlyProjection,
                AlertSeverity::Warning,
                breakdown.total_cost,
                t.monthly_budget,
                true,
                format!(
                    "Projected monthly cost {:.2} exceeds budget {:.2}",
                    breakdown.total_cost, t.monthly_budget
                ),
            ));
        }

        let resources = [
            (
                AlertType::ReadOperations,
                "Read operations",
                breakdown.reads.total_cost,
                t.read_operations_cost_threshold,
            ),
            (
                AlertType::RuleEvaluations,
                "Rule evaluations",
                breakdown.rule_evaluations.total_cost,
                t.rule_evaluations_cost_threshold,
            ),
            (
                AlertType::Storage,
                "Storage",
                breakdown.storage.total_cost,
                t.storage_cost_threshold,
            ),
            (
                AlertType::Bandwidth,
                "Bandwidth",
                breakdown.bandwidth.total_cost,
                t.bandwidth_cost_threshold,
            ),
        ];
        for (alert_type, label, cost, threshold) in resources {
            if cost > threshold {
                raised.push(self.alert(
                    alert_type,
                    AlertSeverity::Warning,
                    cost,
                    threshold,
                    false,
                    format!("{label} cost {cost:.2}/month exceeds threshold {threshold:.2}"),
                ));
            }
        }

        if let Some(increase) = self.spike_percentage() {
            if increase > t.cost_spike_percentage {
                let critical = increase > CRITICAL_SPIKE_PERCENTAGE;
                raised.push(self.alert(
                    AlertType::CostSpike,
                    if critical {
                        AlertSeverity::Critical
                    } else {
                        AlertSeverity::Warning
                    },
                    increase,
                    t.cost_spike_percentage,
                    critical,
                    format!(
                        "Daily cost rose {increase:.1}% over the trailing {SPIKE_BASELINE_SAMPLES}-day average"
                    ),
                ));
            }
        }

        raised
    }

    /// Evaluate a breakdown, retain the raised alerts and notify subscribers.
    pub fn monitor_cost_thresholds(&self, breakdown: &CostBreakdown) -> Vec<CostAlert> {
        let raised = self.evaluate(breakdown);
        if raised.is_empty() {
            return raised;
        }

        if let Ok(mut alerts) = self.alerts.write() {
            for alert in &raised {
                alerts.push_back(alert.clone());
            }
            while alerts.len() > self.max_retained {
                alerts.pop_front();
            }
        }

        for alert in &raised {
            tracing::warn!(
                alert_id = %alert.id,
                alert_type = ?alert.alert_type,
                severity = ?alert.severity,
                current_value = alert.current_value,
                threshold = alert.threshold,
                "Cost alert raised"
            );
            self.notify(alert);
        }

        raised
    }

    /// Record today's samples from a daily breakdown, then monitor it.
    ///
    /// Calling this several times a day keeps one sample per day, holding
    /// the latest breakdown.
    pub fn observe(&self, breakdown: &CostBreakdown) -> Vec<CostAlert> {
        self.record_sample(CostMetric::TotalDailyCost, breakdown.total_daily_cost);
        self.record_sample(CostMetric::ReadsCost, breakdown.reads.total_cost / DAYS_PER_MONTH);
        self.record_sample(
            CostMetric::RuleEvaluationsCost,
            breakdown.rule_evaluations.total_cost / DAYS_PER_MONTH,
        );
        self.record_sample(CostMetric::StorageCost, breakdown.storage.total_cost / DAYS_PER_MONTH);
        self.record_sample(
            CostMetric::BandwidthCost,
            breakdown.bandwidth.total_cost / DAYS_PER_MONTH,
        );
        self.monitor_cost_thresholds(breakdown)
    }

    // ------------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------------

    /// Register a callback invoked for every raised alert.
    pub fn subscribe_to_alerts<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CostAlert) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push((id, Arc::new(callback)));
        }
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|(sid, _)| *sid != id);
                subscribers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of subscriber invocations that panicked.
    pub fn subscriber_failures(&self) -> u64 {
        self.subscriber_failures.load(Ordering::Relaxed)
    }

    fn notify(&self, alert: &CostAlert) {
        // Callbacks run without the lock held so they may subscribe or unsubscribe.
        let callbacks: Vec<(SubscriptionId, AlertCallback)> = self
            .subscribers
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(alert))).is_err() {
                self.subscriber_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    subscription = id.0,
                    alert_id = %alert.id,
                    "Alert subscriber panicked, continuing with remaining subscribers"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Retained alerts
    // ------------------------------------------------------------------------

    /// All retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<CostAlert> {
        self.alerts
            .read()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Alerts raised within the last `window`.
    pub fn recent_alerts(&self, window: Duration) -> Vec<CostAlert> {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        let now = self.clock.now();
        let since = now.checked_sub_signed(window);
        self.alerts
            .read()
            .map(|a| {
                a.iter()
                    .filter(|alert| since.map_or(true, |s| alert.timestamp >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove one alert. Returns false if no alert had that id.
    pub fn clear_alert(&self, id: AlertId) -> bool {
        match self.alerts.write() {
            Ok(mut alerts) => {
                let before = alerts.len();
                alerts.retain(|a| a.id != id);
                alerts.len() != before
            }
            Err(_) => false,
        }
    }

    /// Remove every retained alert. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        self.alerts
            .write()
            .map(|mut alerts| {
                let n = alerts.len();
                alerts.clear();
                n
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tally_core::{CostModel, ManualClock, PricingTable, Timeframe};

    fn engine() -> AlertEngine {
        AlertEngine::new(CostThresholds::factory_default()).unwrap()
    }

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap() + chrono::Days::new(n)
    }

    fn record_days(engine: &AlertEngine, values: &[f64]) {
        for (n, value) in values.iter().enumerate() {
            engine.record_daily_sample(CostMetric::TotalDailyCost, day(n as u64), *value);
        }
    }

    fn breakdown(reads: u64, bandwidth_gb: f64) -> CostBreakdown {
        CostModel::new(PricingTable::factory_default()).calculate_cost_breakdown(
            reads,
            0,
            0.0,
            bandwidth_gb,
            Timeframe::Daily,
        )
    }

    #[test]
    fn test_quiet_breakdown_raises_nothing() {
        let engine = engine();
        assert!(engine.monitor_cost_thresholds(&breakdown(10_000, 0.1)).is_empty());
        assert!(engine.alerts().is_empty());
    }

    #[test]
    fn test_threshold_order_and_severity() {
        let engine = engine();
        // Bandwidth (40 - 0.36) * 0.15 * 30 = 178.38/month.
        let alerts = engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        let types: Vec<AlertType> = alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![AlertType::DailyBudget, AlertType::MonthlyProjection, AlertType::Bandwidth]
        );
        assert!(alerts.iter().all(|a| a.severity == AlertSeverity::Warning));
        assert!(alerts[0].action_required);
        assert!(!alerts[2].action_required);
    }

    #[test]
    fn test_repeated_monitoring_is_stable() {
        let engine = engine();
        let b = breakdown(10_000_000, 40.0);
        let first = engine.monitor_cost_thresholds(&b);
        let second = engine.monitor_cost_thresholds(&b);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert!(a.same_crossing(b));
            assert_ne!(a.id, b.id);
        }
    }

    #[test]
    fn test_spike_needs_eight_samples() {
        let engine = engine();
        record_days(&engine, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 10.0]);
        assert_eq!(engine.spike_percentage(), None);

        let quiet = breakdown(0, 0.0);
        assert!(engine.evaluate(&quiet).is_empty());
    }

    #[test]
    fn test_spike_severity_escalates() {
        let engine = engine();
        record_days(&engine, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.6]);
        let alerts = engine.evaluate(&breakdown(0, 0.0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::CostSpike);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        engine.record_daily_sample(CostMetric::TotalDailyCost, day(8), 2.5);
        // Baseline is now six 1.0 samples and 1.6.
        let alerts = engine.evaluate(&breakdown(0, 0.0));
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert!(alerts[0].action_required);
    }

    #[test]
    fn test_history_window_is_bounded() {
        let engine = engine();
        for i in 0..45 {
            engine.record_daily_sample(CostMetric::ReadsCost, day(i), i as f64);
        }
        let history = engine.history(CostMetric::ReadsCost);
        assert_eq!(history.len(), HISTORY_WINDOW);
        assert_eq!(history[0], 15.0);
    }

    #[test]
    fn test_observe_records_samples() {
        let engine = engine();
        engine.observe(&breakdown(0, 0.0));
        assert_eq!(engine.history(CostMetric::TotalDailyCost).len(), 1);
        assert_eq!(engine.history(CostMetric::BandwidthCost).len(), 1);
    }

    #[test]
    fn test_same_day_samples_replace_each_other() {
        let start = day(0).and_hms_opt(0, 30, 0).unwrap().and_utc();
        let clock = Arc::new(ManualClock::new(start));
        let engine = engine().with_clock(clock.clone());

        // Hourly checks for most of one day, the last one much more expensive.
        for hour in 0..20 {
            let value = if hour == 19 { 40.0 } else { 1.0 };
            engine.record_sample(CostMetric::TotalDailyCost, value);
            clock.advance(Duration::from_secs(60 * 60));
        }

        assert_eq!(engine.history(CostMetric::TotalDailyCost), vec![40.0]);
        assert_eq!(engine.spike_percentage(), None);
    }

    #[test]
    fn test_older_day_is_ignored() {
        let engine = engine();
        engine.record_daily_sample(CostMetric::StorageCost, day(3), 2.0);
        engine.record_daily_sample(CostMetric::StorageCost, day(1), 9.0);
        assert_eq!(engine.history(CostMetric::StorageCost), vec![2.0]);
    }

    #[test]
    fn test_from_config_applies_retention() {
        let mut config = TallyConfig::factory_default();
        config.monitor.max_retained_alerts = 2;
        let engine = AlertEngine::from_config(&config).unwrap();

        engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        assert_eq!(engine.alerts().len(), 2);

        config.monitor.interval_secs = 0;
        assert!(AlertEngine::from_config(&config).is_err());
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let engine = engine();
        let delivered = Arc::new(AtomicUsize::new(0));

        engine.subscribe_to_alerts(|_| panic!("subscriber bug"));
        let counter = delivered.clone();
        engine.subscribe_to_alerts(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let alerts = engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        assert_eq!(delivered.load(Ordering::SeqCst), alerts.len());
        assert_eq!(engine.subscriber_failures(), alerts.len() as u64);
    }

    #[test]
    fn test_unsubscribe() {
        let engine = engine();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let id = engine.subscribe_to_alerts(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
        engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_alert_and_ring_buffer() {
        let engine = engine().with_max_retained_alerts(4);
        let raised = engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        assert_eq!(raised.len(), 3);
        engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        assert_eq!(engine.alerts().len(), 4);

        let newest = engine.alerts().last().unwrap().id;
        assert!(engine.clear_alert(newest));
        assert!(!engine.clear_alert(newest));
        assert_eq!(engine.clear_all(), 3);
    }

    #[test]
    fn test_recent_alerts_window() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = engine().with_clock(clock.clone());

        engine.monitor_cost_thresholds(&breakdown(10_000, 40.0));
        clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
        engine.monitor_cost_thresholds(&breakdown(10_000, 0.1));
        // Second call is under every threshold.
        assert!(engine.recent_alerts(Duration::from_secs(24 * 60 * 60)).is_empty());
        assert_eq!(engine.alerts().len(), 3);
    }

    #[test]
    fn test_new_rejects_invalid_thresholds() {
        let thresholds = CostThresholds {
            monthly_budget: f64::NAN,
            ..CostThresholds::factory_default()
        };
        assert!(AlertEngine::new(thresholds).is_err());
    }
}
