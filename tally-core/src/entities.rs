//! Entity types shared across the cache, tracker and alert engine

use crate::{AlertId, Timestamp, ValidationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CACHE
// ============================================================================

/// Cache layer discriminator, ordered fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayerKind {
    /// In-process memory.
    Memory,
    /// Persistent local key-value store.
    Local,
    /// Remote document store (source of truth).
    Remote,
}

/// Kind of platform data being cached. Drives the default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Novel,
    Chapter,
    UserProfile,
    Review,
    Comment,
    Stats,
    Notification,
    Static,
}

impl DataType {
    /// Default time-to-live for this kind of data.
    pub fn default_ttl(&self) -> Duration {
        match self {
            DataType::Novel => Duration::from_secs(30 * 60),
            DataType::Chapter => Duration::from_secs(60 * 60),
            DataType::UserProfile => Duration::from_secs(15 * 60),
            DataType::Review => Duration::from_secs(10 * 60),
            DataType::Comment => Duration::from_secs(5 * 60),
            DataType::Stats => Duration::from_secs(5 * 60),
            DataType::Notification => Duration::from_secs(60),
            DataType::Static => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Novel => "novel",
            DataType::Chapter => "chapter",
            DataType::UserProfile => "user_profile",
            DataType::Review => "review",
            DataType::Comment => "comment",
            DataType::Stats => "stats",
            DataType::Notification => "notification",
            DataType::Static => "static",
        }
    }
}

/// One cached value in one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub inserted_at: Timestamp,
    pub ttl_seconds: u64,
    pub layer: CacheLayerKind,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        inserted_at: Timestamp,
        ttl_seconds: u64,
        layer: CacheLayerKind,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            inserted_at,
            ttl_seconds,
            layer,
        }
    }

    /// Age of the entry at `now`. Zero if `now` precedes insertion.
    pub fn age_at(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.inserted_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// An entry is fresh iff `now - inserted_at < ttl_seconds`.
    pub fn is_fresh_at(&self, now: Timestamp) -> bool {
        let elapsed_ms = now.signed_duration_since(self.inserted_at).num_milliseconds();
        let ttl_ms = i64::try_from(self.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        elapsed_ms < ttl_ms
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        !self.is_fresh_at(now)
    }

    /// TTL left at `now`, zero once expired.
    pub fn remaining_ttl(&self, now: Timestamp) -> Duration {
        Duration::from_secs(self.ttl_seconds).saturating_sub(self.age_at(now))
    }

    /// Copy of this entry relabelled for another layer.
    pub fn in_layer(&self, layer: CacheLayerKind) -> Self {
        Self {
            layer,
            ..self.clone()
        }
    }
}

// ============================================================================
// OPERATION RECORDS
// ============================================================================

/// One logged read. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOperationRecord {
    pub collection: String,
    pub document_count: u64,
    pub timestamp: Timestamp,
    pub cache_hit: bool,
}

/// One logged batch of server-side rule evaluations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluationRecord {
    pub collection: String,
    pub operation: String,
    pub evaluation_count: u64,
    pub timestamp: Timestamp,
}

/// Usage totals fed into the cost model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub reads: u64,
    pub rule_evaluations: u64,
    pub storage_gb: f64,
    pub bandwidth_gb: f64,
}

impl UsageSnapshot {
    /// Reject negative or non-finite sizes before they reach the cost model.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("storage_gb", self.storage_gb),
            ("bandwidth_gb", self.bandwidth_gb),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be a finite number".to_string(),
                });
            }
            if value < 0.0 {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be non-negative".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Billing window of a usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Daily,
    Monthly,
}

impl Timeframe {
    /// Factor that projects a per-timeframe cost to a monthly cost.
    pub fn monthly_multiplier(&self) -> f64 {
        match self {
            Timeframe::Daily => 30.0,
            Timeframe::Monthly => 1.0,
        }
    }
}

// ============================================================================
// ALERTS
// ============================================================================

/// What crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DailyBudget,
    MonthlyProjection,
    ReadOperations,
    RuleEvaluations,
    Storage,
    Bandwidth,
    CostSpike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// An alert raised by the alert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAlert {
    pub id: AlertId,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: Timestamp,
    pub action_required: bool,
    pub message: String,
}

impl CostAlert {
    /// True when two alerts describe the same crossing, ignoring identity and time.
    pub fn same_crossing(&self, other: &CostAlert) -> bool {
        self.alert_type == other.alert_type
            && self.severity == other.severity
            && self.current_value == other.current_value
            && self.threshold == other.threshold
            && self.action_required == other.action_required
    }
}

// ============================================================================
// OPTIMIZATION OPPORTUNITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityType {
    /// Cache and batch document reads.
    ReadReduction,
    /// Simplify or short-circuit security rules.
    RuleSimplification,
    /// Archive or delete cold documents.
    StorageCleanup,
    /// Compress payloads and trim projections.
    BandwidthReduction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImplementationEffort {
    Low,
    Medium,
    High,
}

/// Derived recommendation. Computed fresh from a breakdown, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationOpportunity {
    #[serde(rename = "type")]
    pub opportunity_type: OpportunityType,
    pub priority: Priority,
    pub potential_savings: f64,
    pub savings_percentage: f64,
    pub implementation_effort: ImplementationEffort,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn entry_with_ttl(ttl_seconds: u64) -> (CacheEntry, Timestamp) {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "novels/1",
            serde_json::json!({"title": "x"}),
            now,
            ttl_seconds,
            CacheLayerKind::Memory,
        );
        (entry, now)
    }

    #[test]
    fn test_entry_fresh_until_ttl_boundary() {
        let (entry, inserted) = entry_with_ttl(60);
        assert!(entry.is_fresh_at(inserted));
        assert!(entry.is_fresh_at(inserted + ChronoDuration::seconds(59)));
        assert!(entry.is_expired_at(inserted + ChronoDuration::seconds(60)));
        assert!(entry.is_expired_at(inserted + ChronoDuration::seconds(3600)));
    }

    #[test]
    fn test_zero_ttl_is_never_fresh() {
        let (entry, inserted) = entry_with_ttl(0);
        assert!(entry.is_expired_at(inserted));
    }

    #[test]
    fn test_remaining_ttl() {
        let (entry, inserted) = entry_with_ttl(100);
        assert_eq!(
            entry.remaining_ttl(inserted + ChronoDuration::seconds(40)),
            Duration::from_secs(60)
        );
        assert_eq!(
            entry.remaining_ttl(inserted + ChronoDuration::seconds(400)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_usage_snapshot_validation() {
        let ok = UsageSnapshot {
            reads: 10,
            rule_evaluations: 10,
            storage_gb: 1.5,
            bandwidth_gb: 0.0,
        };
        assert!(ok.validate().is_ok());

        let negative = UsageSnapshot {
            storage_gb: -1.0,
            ..ok
        };
        assert!(negative.validate().is_err());

        let nan = UsageSnapshot {
            bandwidth_gb: f64::NAN,
            ..ok
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_data_type_ttls_ordering() {
        assert!(DataType::Notification.default_ttl() < DataType::Novel.default_ttl());
        assert!(DataType::Novel.default_ttl() < DataType::Static.default_ttl());
    }

    #[test]
    fn test_alert_serializes_type_field() {
        let alert = CostAlert {
            id: AlertId::now_v7(),
            alert_type: AlertType::DailyBudget,
            severity: AlertSeverity::Warning,
            current_value: 6.0,
            threshold: 5.0,
            timestamp: Utc::now(),
            action_required: true,
            message: "over budget".to_string(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "daily_budget");
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["actionRequired"], true);
    }
}
