//! Tally Core - shared types
//!
//! Entities, configuration, errors, time and the cost model. Every other
//! Tally crate depends on this one; it performs no I/O beyond reading a
//! config file.

pub mod config;
pub mod cost;
pub mod entities;
pub mod error;
pub mod health;
pub mod identity;

pub use config::{
    CacheConfig, CostThresholds, MonitorConfig, OptimizationConfig, PricingTable, ResourcePricing,
    TallyConfig,
};
pub use cost::{CostBreakdown, CostModel, OptimizationTargets, ResourceCost, DAYS_PER_MONTH};
pub use entities::{
    AlertSeverity, AlertType, CacheEntry, CacheLayerKind, CostAlert, DataType,
    ImplementationEffort, OpportunityType, OptimizationOpportunity, Priority,
    ReadOperationRecord, RuleEvaluationRecord, Timeframe, UsageSnapshot,
};
pub use error::{
    CacheError, ConfigError, RemoteError, TallyError, TallyResult, TelemetryError,
    ValidationError,
};
pub use health::{HealthCheck, HealthStatus};
pub use identity::{AlertId, Clock, ManualClock, SessionId, SystemClock, Timestamp};
