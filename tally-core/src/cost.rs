//! Cost model
//!
//! Pure, deterministic conversion of usage counts into monetary estimates.
//! Nothing here performs I/O or validates input; callers run
//! [`UsageSnapshot::validate`] first.

use crate::{
    ImplementationEffort, OpportunityType, OptimizationOpportunity, PricingTable, Priority,
    ResourcePricing, Timeframe, UsageSnapshot,
};
use serde::{Deserialize, Serialize};

/// Days used to project daily figures onto a month.
pub const DAYS_PER_MONTH: f64 = 30.0;

/// Importance weights of each resource in the optimization potential.
const READS_WEIGHT: f64 = 0.40;
const RULE_EVALUATIONS_WEIGHT: f64 = 0.30;
const STORAGE_WEIGHT: f64 = 0.20;
const BANDWIDTH_WEIGHT: f64 = 0.10;

/// Maximum reduction (percent) credited to each resource.
const READS_MAX_REDUCTION: f64 = 70.0;
const RULE_EVALUATIONS_MAX_REDUCTION: f64 = 60.0;
const STORAGE_MAX_REDUCTION: f64 = 30.0;
const BANDWIDTH_MAX_REDUCTION: f64 = 50.0;

/// Savings (currency units per month) at or above which an opportunity is high priority.
const HIGH_PRIORITY_SAVINGS: f64 = 10.0;
const MEDIUM_PRIORITY_SAVINGS: f64 = 1.0;

/// Cost of one resource inside a breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCost {
    /// Raw usage in the breakdown's timeframe.
    pub usage: f64,
    /// Usage left after the free allowance.
    pub billable_usage: f64,
    /// Price per pricing unit.
    pub unit_price: f64,
    /// Projected monthly cost.
    pub total_cost: f64,
}

/// Derived cost aggregate. Recomputed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub timeframe: Timeframe,
    pub reads: ResourceCost,
    pub rule_evaluations: ResourceCost,
    pub storage: ResourceCost,
    pub bandwidth: ResourceCost,
    /// Projected monthly total.
    pub total_cost: f64,
    /// Average daily share of the monthly total.
    pub total_daily_cost: f64,
    /// Heuristic reduction achievable, 0-100.
    pub optimization_potential: f64,
}

impl CostBreakdown {
    pub fn projected_monthly_cost(&self) -> f64 {
        self.total_cost
    }
}

/// Usage levels a well-optimized deployment aims for, per day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizationTargets {
    pub reads_per_day: f64,
    pub rule_evaluations_per_day: f64,
    pub storage_gb: f64,
    pub bandwidth_gb_per_day: f64,
}

impl Default for OptimizationTargets {
    fn default() -> Self {
        Self {
            reads_per_day: 45.0,
            rule_evaluations_per_day: 30.0,
            storage_gb: 1.0,
            bandwidth_gb_per_day: 0.1,
        }
    }
}

/// Cost model over a pricing table.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostModel {
    pricing: PricingTable,
    targets: OptimizationTargets,
}

impl CostModel {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            targets: OptimizationTargets::default(),
        }
    }

    pub fn with_targets(mut self, targets: OptimizationTargets) -> Self {
        self.targets = targets;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Convert usage counts into a cost breakdown.
    ///
    /// Each resource pays only for usage above its free allowance. Daily
    /// figures are multiplied by 30 to project a month; storage is already
    /// a monthly quantity and is never re-multiplied.
    pub fn calculate_cost_breakdown(
        &self,
        read_count: u64,
        rule_evaluation_count: u64,
        storage_gb: f64,
        bandwidth_gb: f64,
        timeframe: Timeframe,
    ) -> CostBreakdown {
        let multiplier = timeframe.monthly_multiplier();
        // Per-day allowances cover a whole month when the usage is monthly.
        let allowance_scale = match timeframe {
            Timeframe::Daily => 1.0,
            Timeframe::Monthly => DAYS_PER_MONTH,
        };

        let reads = metered_cost(
            read_count as f64,
            &self.pricing.reads,
            self.pricing.reads.free_allowance * allowance_scale,
            multiplier,
        );
        let rule_evaluations = metered_cost(
            rule_evaluation_count as f64,
            &self.pricing.rule_evaluations,
            self.pricing.rule_evaluations.free_allowance * allowance_scale,
            multiplier,
        );
        let storage = metered_cost(
            storage_gb,
            &self.pricing.storage,
            self.pricing.storage.free_allowance,
            1.0,
        );
        let bandwidth = metered_cost(
            bandwidth_gb,
            &self.pricing.bandwidth,
            self.pricing.bandwidth.free_allowance * allowance_scale,
            multiplier,
        );

        let total_cost = reads.total_cost
            + rule_evaluations.total_cost
            + storage.total_cost
            + bandwidth.total_cost;

        let mut breakdown = CostBreakdown {
            timeframe,
            reads,
            rule_evaluations,
            storage,
            bandwidth,
            total_cost,
            total_daily_cost: total_cost / DAYS_PER_MONTH,
            optimization_potential: 0.0,
        };
        breakdown.optimization_potential = self.optimization_potential(&breakdown);
        breakdown
    }

    /// Breakdown for a usage snapshot.
    pub fn breakdown_for(&self, usage: &UsageSnapshot, timeframe: Timeframe) -> CostBreakdown {
        self.calculate_cost_breakdown(
            usage.reads,
            usage.rule_evaluations,
            usage.storage_gb,
            usage.bandwidth_gb,
            timeframe,
        )
    }

    /// Weighted, capped reduction achievable against the targets (0-100).
    pub fn optimization_potential(&self, breakdown: &CostBreakdown) -> f64 {
        let total = self
            .reductions(breakdown)
            .iter()
            .map(|r| r.percentage * r.weight)
            .sum::<f64>();
        total.clamp(0.0, 100.0)
    }

    /// Ranked opportunities, largest potential saving first.
    pub fn optimization_opportunities(
        &self,
        breakdown: &CostBreakdown,
    ) -> Vec<OptimizationOpportunity> {
        let mut opportunities: Vec<OptimizationOpportunity> = self
            .reductions(breakdown)
            .into_iter()
            .filter(|r| r.percentage > 0.0)
            .map(|r| {
                let potential_savings = r.monthly_cost * r.percentage / 100.0;
                OptimizationOpportunity {
                    opportunity_type: r.kind,
                    priority: priority_for(potential_savings),
                    potential_savings,
                    savings_percentage: r.percentage,
                    implementation_effort: effort_for(r.kind),
                    description: description_for(r.kind).to_string(),
                }
            })
            .collect();

        opportunities.sort_by(|a, b| {
            b.potential_savings
                .partial_cmp(&a.potential_savings)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.savings_percentage
                        .partial_cmp(&a.savings_percentage)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        opportunities
    }

    fn reductions(&self, breakdown: &CostBreakdown) -> [Reduction; 4] {
        let per_day = match breakdown.timeframe {
            Timeframe::Daily => 1.0,
            Timeframe::Monthly => DAYS_PER_MONTH,
        };
        [
            Reduction {
                kind: OpportunityType::ReadReduction,
                percentage: capped_reduction(
                    breakdown.reads.usage / per_day,
                    self.targets.reads_per_day,
                    READS_MAX_REDUCTION,
                ),
                weight: READS_WEIGHT,
                monthly_cost: breakdown.reads.total_cost,
            },
            Reduction {
                kind: OpportunityType::RuleSimplification,
                percentage: capped_reduction(
                    breakdown.rule_evaluations.usage / per_day,
                    self.targets.rule_evaluations_per_day,
                    RULE_EVALUATIONS_MAX_REDUCTION,
                ),
                weight: RULE_EVALUATIONS_WEIGHT,
                monthly_cost: breakdown.rule_evaluations.total_cost,
            },
            Reduction {
                kind: OpportunityType::StorageCleanup,
                percentage: capped_reduction(
                    breakdown.storage.usage,
                    self.targets.storage_gb,
                    STORAGE_MAX_REDUCTION,
                ),
                weight: STORAGE_WEIGHT,
                monthly_cost: breakdown.storage.total_cost,
            },
            Reduction {
                kind: OpportunityType::BandwidthReduction,
                percentage: capped_reduction(
                    breakdown.bandwidth.usage / per_day,
                    self.targets.bandwidth_gb_per_day,
                    BANDWIDTH_MAX_REDUCTION,
                ),
                weight: BANDWIDTH_WEIGHT,
                monthly_cost: breakdown.bandwidth.total_cost,
            },
        ]
    }
}

struct Reduction {
    kind: OpportunityType,
    percentage: f64,
    weight: f64,
    monthly_cost: f64,
}

fn metered_cost(
    usage: f64,
    pricing: &ResourcePricing,
    allowance: f64,
    multiplier: f64,
) -> ResourceCost {
    let billable_usage = (usage - allowance).max(0.0);
    ResourceCost {
        usage,
        billable_usage,
        unit_price: pricing.price_per_unit,
        total_cost: billable_usage / pricing.unit_size * pricing.price_per_unit * multiplier,
    }
}

fn capped_reduction(current: f64, target: f64, cap: f64) -> f64 {
    if current <= target || current <= 0.0 {
        return 0.0;
    }
    ((current - target) / current * 100.0).min(cap)
}

fn priority_for(savings: f64) -> Priority {
    if savings >= HIGH_PRIORITY_SAVINGS {
        Priority::High
    } else if savings >= MEDIUM_PRIORITY_SAVINGS {
        Priority::Medium
    } else {
        Priority::Low
    }
}

fn effort_for(kind: OpportunityType) -> ImplementationEffort {
    match kind {
        OpportunityType::ReadReduction => ImplementationEffort::Medium,
        OpportunityType::RuleSimplification => ImplementationEffort::Low,
        OpportunityType::StorageCleanup => ImplementationEffort::High,
        OpportunityType::BandwidthReduction => ImplementationEffort::Medium,
    }
}

fn description_for(kind: OpportunityType) -> &'static str {
    match kind {
        OpportunityType::ReadReduction => {
            "Serve repeated document reads from cache and batch the remaining fetches"
        }
        OpportunityType::RuleSimplification => {
            "Reduce security-rule lookups by denormalizing permission data"
        }
        OpportunityType::StorageCleanup => "Archive stale documents and drop unused fields",
        OpportunityType::BandwidthReduction => {
            "Project only the fields a view needs and paginate large listings"
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
