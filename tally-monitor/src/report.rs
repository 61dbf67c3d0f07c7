//! Exported cost report

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::{
    CostAlert, CostBreakdown, CostModel, OptimizationOpportunity, TelemetryError, Timestamp,
};

use crate::alerts::AlertEngine;

/// Alerts younger than this are included in a report.
pub const REPORT_ALERT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Headline numbers of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_daily_cost: f64,
    pub projected_monthly_cost: f64,
    pub optimization_potential: f64,
}

/// Point-in-time cost report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostReport {
    pub timestamp: Timestamp,
    pub summary: ReportSummary,
    pub breakdown: CostBreakdown,
    pub optimization_opportunities: Vec<OptimizationOpportunity>,
    pub alerts: Vec<CostAlert>,
}

impl CostReport {
    /// Assemble a report from a breakdown and the engine's last 24h of alerts.
    pub fn build(
        model: &CostModel,
        breakdown: CostBreakdown,
        engine: &AlertEngine,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            timestamp,
            summary: ReportSummary {
                total_daily_cost: breakdown.total_daily_cost,
                projected_monthly_cost: breakdown.projected_monthly_cost(),
                optimization_potential: breakdown.optimization_potential,
            },
            optimization_opportunities: model.optimization_opportunities(&breakdown),
            alerts: engine.recent_alerts(REPORT_ALERT_WINDOW),
            breakdown,
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, TelemetryError> {
        serde_json::to_string_pretty(self).map_err(|e| TelemetryError::Export {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::{CostThresholds, PricingTable, Timeframe};

    #[test]
    fn test_report_json_shape() {
        let model = CostModel::new(PricingTable::factory_default());
        let engine = AlertEngine::new(CostThresholds::factory_default()).unwrap();
        let breakdown =
            model.calculate_cost_breakdown(2_000_000, 200_000, 3.0, 40.0, Timeframe::Daily);
        engine.monitor_cost_thresholds(&breakdown);

        let report = CostReport::build(&model, breakdown, &engine, Utc::now());
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert!(json["timestamp"].is_string());
        assert!(json["summary"]["totalDailyCost"].is_number());
        assert!(json["summary"]["projectedMonthlyCost"].is_number());
        assert!(json["summary"]["optimizationPotential"].is_number());
        assert!(json["breakdown"]["reads"]["totalCost"].is_number());
        assert!(!json["optimizationOpportunities"].as_array().unwrap().is_empty());
        assert!(!json["alerts"].as_array().unwrap().is_empty());
        assert!(json["alerts"][0]["type"].is_string());
    }
}
