//! Periodic cost monitor
//!
//! A background task that aggregates the tracker's last 24 hours of usage
//! into a daily [`CostBreakdown`](tally_core::CostBreakdown), feeds it to the
//! alert engine and prunes old operation records.
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(cost_monitor_task(
//!     tracker.clone(),
//!     engine.clone(),
//!     CostModel::new(config.pricing),
//!     config.monitor.clone(),
//!     shutdown_rx,
//! ));
//!
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tally_core::{CostAlert, CostModel, MonitorConfig, TallyResult, Timeframe};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::alerts::AlertEngine;
use crate::tracker::PerformanceTracker;

const USAGE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Counters for the cost monitor.
#[derive(Debug, Default)]
pub struct CostMonitorMetrics {
    /// Completed check cycles
    pub cycles: AtomicU64,
    /// Alerts raised across all cycles
    pub alerts_raised: AtomicU64,
    /// Operation records pruned past retention
    pub records_pruned: AtomicU64,
    /// Cycles skipped because usage failed validation
    pub errors: AtomicU64,
}

impl CostMonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CostMonitorSnapshot {
        CostMonitorSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            records_pruned: self.records_pruned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of monitor metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostMonitorSnapshot {
    pub cycles: u64,
    pub alerts_raised: u64,
    pub records_pruned: u64,
    pub errors: u64,
}

/// Run one monitoring cycle and return the alerts it raised.
pub fn run_cost_check(
    tracker: &PerformanceTracker,
    engine: &AlertEngine,
    model: &CostModel,
    config: &MonitorConfig,
) -> TallyResult<Vec<CostAlert>> {
    let usage = tracker
        .usage_over(USAGE_WINDOW)
        .to_snapshot(config.storage_gb, config.bandwidth_gb_per_day);
    usage.validate()?;

    let breakdown = model.breakdown_for(&usage, Timeframe::Daily);
    tracing::debug!(
        reads = usage.reads,
        rule_evaluations = usage.rule_evaluations,
        total_daily_cost = breakdown.total_daily_cost,
        projected_monthly_cost = breakdown.total_cost,
        "Cost check computed"
    );
    Ok(engine.observe(&breakdown))
}

/// Background task that periodically evaluates cost thresholds.
///
/// Runs until the shutdown signal is received and returns the metrics
/// collected during its lifetime. The first check runs immediately.
pub async fn cost_monitor_task(
    tracker: Arc<PerformanceTracker>,
    engine: Arc<AlertEngine>,
    model: CostModel,
    config: MonitorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CostMonitorMetrics> {
    let metrics = Arc::new(CostMonitorMetrics::new());

    let mut check_interval = interval(config.interval());
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval_secs,
        session_id = %tracker.session_id(),
        "Cost monitor task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Cost monitor task shutting down");
                    break;
                }
            }

            _ = check_interval.tick() => {
                run_cycle(&tracker, &engine, &model, &config, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        alerts_raised = snapshot.alerts_raised,
        records_pruned = snapshot.records_pruned,
        errors = snapshot.errors,
        "Cost monitor task completed"
    );

    metrics
}

fn run_cycle(
    tracker: &PerformanceTracker,
    engine: &AlertEngine,
    model: &CostModel,
    config: &MonitorConfig,
    metrics: &CostMonitorMetrics,
) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    match run_cost_check(tracker, engine, model, config) {
        Ok(alerts) => {
            metrics
                .alerts_raised
                .fetch_add(alerts.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Cost check failed");
        }
    }

    let pruned = tracker.prune();
    if pruned > 0 {
        metrics
            .records_pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);
        tracing::debug!(pruned, "Pruned operation records past retention");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::CostMetric;
    use tally_core::{AlertType, ManualClock, SessionId, TallyConfig};

    fn fixtures() -> (Arc<PerformanceTracker>, Arc<AlertEngine>, CostModel) {
        let config = TallyConfig::factory_default();
        (
            Arc::new(PerformanceTracker::new(SessionId::generate())),
            Arc::new(AlertEngine::from_config(&config).unwrap()),
            CostModel::new(config.pricing),
        )
    }

    #[test]
    fn test_hourly_checks_keep_one_sample_per_day() {
        let config = TallyConfig::factory_default();
        let start = chrono::NaiveDate::from_ymd_opt(2026, 5, 4)
            .unwrap()
            .and_hms_opt(1, 0, 0)
            .unwrap()
            .and_utc();
        let clock = Arc::new(ManualClock::new(start));
        let tracker = PerformanceTracker::new(SessionId::generate()).with_clock(clock.clone());
        let engine = AlertEngine::from_config(&config).unwrap().with_clock(clock.clone());
        let model = CostModel::new(config.pricing);

        for _ in 0..7 {
            tracker.track_read("novels", 1_000_000, false);
            run_cost_check(&tracker, &engine, &model, &config.monitor).unwrap();
            clock.advance(Duration::from_secs(60 * 60));
        }
        tracker.track_read("novels", 4_000_000, false);
        let alerts = run_cost_check(&tracker, &engine, &model, &config.monitor).unwrap();

        assert!(alerts.iter().all(|a| a.alert_type != AlertType::CostSpike));
        assert_eq!(engine.history(CostMetric::TotalDailyCost).len(), 1);
    }

    #[test]
    fn test_run_cost_check_uses_billed_reads() {
        let (tracker, engine, model) = fixtures();
        // 3M billed reads/day -> (3M - 50k) / 100k * 0.036 * 30 = 31.86/month.
        tracker.track_read("novels", 3_000_000, false);
        tracker.track_read("novels", 9_000_000, true);

        let alerts = run_cost_check(&tracker, &engine, &model, &MonitorConfig::default()).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ReadOperations);
    }

    #[test]
    fn test_run_cost_check_rejects_bad_usage() {
        let (tracker, engine, model) = fixtures();
        let config = MonitorConfig {
            storage_gb: -1.0,
            ..Default::default()
        };
        assert!(run_cost_check(&tracker, &engine, &model, &config).is_err());
    }

    #[tokio::test]
    async fn test_task_runs_and_shuts_down() {
        let (tracker, engine, model) = fixtures();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(cost_monitor_task(
            tracker,
            engine.clone(),
            model,
            MonitorConfig::default(),
            shutdown_rx,
        ));

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let metrics = handle.await.unwrap().snapshot();
        assert_eq!(metrics.cycles, 1);
        assert_eq!(metrics.errors, 0);
        assert_eq!(engine.history(CostMetric::TotalDailyCost).len(), 1);
    }
}
