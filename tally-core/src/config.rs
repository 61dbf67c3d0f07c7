//! Configuration types
//!
//! Every section validates itself; constructors of the services that consume
//! a section call `validate()` so malformed configuration fails at startup
//! rather than on the first call.

use crate::{ConfigError, DataType, TallyError, TallyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn invalid(field: &str, value: impl ToString, reason: &str) -> TallyError {
    TallyError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.trim(), "true" | "1" | "yes" | "on"))
}

// ============================================================================
// QUERY OPTIMIZATION
// ============================================================================

/// Toggles for the query optimizer.
///
/// With `cache_enabled = false` the optimizer runs in pass-through mode: no
/// cache reads or writes and one remote call per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizationConfig {
    pub enable_batch_reads: bool,
    pub enable_query_consolidation: bool,
    /// Allow merged queries that carry extra filters besides the merged
    /// `in` predicate (these need a composite index on the remote store).
    pub enable_composite_indexes: bool,
    pub max_batch_size: usize,
    pub cache_enabled: bool,
    pub default_data_type: DataType,
    /// Upper bound on every remote call, in milliseconds.
    pub remote_timeout_ms: u64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enable_batch_reads: true,
            enable_query_consolidation: true,
            enable_composite_indexes: true,
            max_batch_size: 10,
            cache_enabled: true,
            default_data_type: DataType::Novel,
            remote_timeout_ms: 10_000,
        }
    }
}

impl OptimizationConfig {
    /// Config with every optimization switched off.
    pub fn pass_through() -> Self {
        Self {
            enable_batch_reads: false,
            enable_query_consolidation: false,
            enable_composite_indexes: false,
            cache_enabled: false,
            ..Self::default()
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TALLY_ENABLE_BATCH_READS`
    /// - `TALLY_ENABLE_QUERY_CONSOLIDATION`
    /// - `TALLY_ENABLE_COMPOSITE_INDEXES`
    /// - `TALLY_MAX_BATCH_SIZE`
    /// - `TALLY_CACHE_ENABLED`
    /// - `TALLY_REMOTE_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            enable_batch_reads: env_flag("TALLY_ENABLE_BATCH_READS")
                .unwrap_or(defaults.enable_batch_reads),
            enable_query_consolidation: env_flag("TALLY_ENABLE_QUERY_CONSOLIDATION")
                .unwrap_or(defaults.enable_query_consolidation),
            enable_composite_indexes: env_flag("TALLY_ENABLE_COMPOSITE_INDEXES")
                .unwrap_or(defaults.enable_composite_indexes),
            max_batch_size: env_parse("TALLY_MAX_BATCH_SIZE").unwrap_or(defaults.max_batch_size),
            cache_enabled: env_flag("TALLY_CACHE_ENABLED").unwrap_or(defaults.cache_enabled),
            default_data_type: defaults.default_data_type,
            remote_timeout_ms: env_parse("TALLY_REMOTE_TIMEOUT_MS")
                .unwrap_or(defaults.remote_timeout_ms),
        }
    }

    pub fn is_pass_through(&self) -> bool {
        !self.cache_enabled
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn validate(&self) -> TallyResult<()> {
        if self.max_batch_size == 0 {
            return Err(invalid(
                "max_batch_size",
                self.max_batch_size,
                "max_batch_size must be greater than 0",
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(invalid(
                "remote_timeout_ms",
                self.remote_timeout_ms,
                "remote_timeout_ms must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Configuration for the cache manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// TTL used when neither the caller nor a data type names one.
    pub default_ttl_secs: u64,
    /// Maximum number of entries held in the memory layer.
    pub max_memory_entries: usize,
    /// Whether the persistent local layer should be opened.
    pub persistent_enabled: bool,
    /// Directory of the persistent layer.
    pub persistent_path: Option<PathBuf>,
    /// Capacity ceiling of the persistent layer in megabytes.
    pub persistent_max_size_mb: usize,
    /// Per data type TTL overrides, in seconds.
    #[serde(default)]
    pub ttl_overrides: HashMap<DataType, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_memory_entries: 10_000,
            persistent_enabled: false,
            persistent_path: None,
            persistent_max_size_mb: 64,
            ttl_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the memory layer capacity.
    pub fn with_max_memory_entries(mut self, max: usize) -> Self {
        self.max_memory_entries = max;
        self
    }

    /// Enable the persistent layer at `path`.
    pub fn with_persistent(mut self, path: impl Into<PathBuf>, max_size_mb: usize) -> Self {
        self.persistent_enabled = true;
        self.persistent_path = Some(path.into());
        self.persistent_max_size_mb = max_size_mb;
        self
    }

    /// Override the TTL of one data type.
    pub fn with_ttl_override(mut self, data_type: DataType, ttl: Duration) -> Self {
        self.ttl_overrides.insert(data_type, ttl.as_secs());
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// TTL for a data type: explicit override, else the type's own default.
    pub fn ttl_for(&self, data_type: DataType) -> Duration {
        self.ttl_overrides
            .get(&data_type)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| data_type.default_ttl())
    }

    pub fn validate(&self) -> TallyResult<()> {
        if self.default_ttl_secs == 0 {
            return Err(invalid(
                "default_ttl_secs",
                self.default_ttl_secs,
                "default_ttl_secs must be positive",
            ));
        }
        if self.max_memory_entries == 0 {
            return Err(invalid(
                "max_memory_entries",
                self.max_memory_entries,
                "max_memory_entries must be greater than 0",
            ));
        }
        if self.persistent_enabled {
            if self.persistent_path.is_none() {
                return Err(TallyError::Config(ConfigError::MissingRequired {
                    field: "persistent_path".to_string(),
                }));
            }
            if self.persistent_max_size_mb == 0 {
                return Err(invalid(
                    "persistent_max_size_mb",
                    self.persistent_max_size_mb,
                    "persistent_max_size_mb must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// COST THRESHOLDS
// ============================================================================

/// Budgets and thresholds the alert engine evaluates against.
///
/// Budgets are in currency units. Per-resource thresholds compare against the
/// projected monthly cost of that resource. `cost_spike_percentage` is the
/// day-over-trailing-week increase that counts as a spike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostThresholds {
    pub daily_budget: f64,
    pub monthly_budget: f64,
    pub read_operations_cost_threshold: f64,
    pub rule_evaluations_cost_threshold: f64,
    pub storage_cost_threshold: f64,
    pub bandwidth_cost_threshold: f64,
    pub cost_spike_percentage: f64,
}

impl CostThresholds {
    /// Documented factory default for a small production deployment.
    pub fn factory_default() -> Self {
        Self {
            daily_budget: 5.0,
            monthly_budget: 100.0,
            read_operations_cost_threshold: 30.0,
            rule_evaluations_cost_threshold: 15.0,
            storage_cost_threshold: 10.0,
            bandwidth_cost_threshold: 20.0,
            cost_spike_percentage: 50.0,
        }
    }

    pub fn validate(&self) -> TallyResult<()> {
        let fields = [
            ("daily_budget", self.daily_budget),
            ("monthly_budget", self.monthly_budget),
            ("read_operations_cost_threshold", self.read_operations_cost_threshold),
            ("rule_evaluations_cost_threshold", self.rule_evaluations_cost_threshold),
            ("storage_cost_threshold", self.storage_cost_threshold),
            ("bandwidth_cost_threshold", self.bandwidth_cost_threshold),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, value, "must be a non-negative finite number"));
            }
        }
        if !self.cost_spike_percentage.is_finite() || self.cost_spike_percentage <= 0.0 {
            return Err(invalid(
                "cost_spike_percentage",
                self.cost_spike_percentage,
                "cost_spike_percentage must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// PRICING
// ============================================================================

/// Price of one metered resource.
///
/// `price_per_unit` is charged for every `unit_size` billable units above the
/// free allowance. Operation and bandwidth allowances are per day; storage
/// allowance is per month.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcePricing {
    pub unit_size: f64,
    pub price_per_unit: f64,
    pub free_allowance: f64,
}

impl ResourcePricing {
    fn validate(&self, field: &str) -> TallyResult<()> {
        if !self.unit_size.is_finite() || self.unit_size <= 0.0 {
            return Err(invalid(
                &format!("{field}.unit_size"),
                self.unit_size,
                "unit_size must be positive",
            ));
        }
        if !self.price_per_unit.is_finite() || self.price_per_unit < 0.0 {
            return Err(invalid(
                &format!("{field}.price_per_unit"),
                self.price_per_unit,
                "price_per_unit must be non-negative",
            ));
        }
        if !self.free_allowance.is_finite() || self.free_allowance < 0.0 {
            return Err(invalid(
                &format!("{field}.free_allowance"),
                self.free_allowance,
                "free_allowance must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Pricing table of the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingTable {
    pub reads: ResourcePricing,
    pub rule_evaluations: ResourcePricing,
    pub storage: ResourcePricing,
    pub bandwidth: ResourcePricing,
}

impl PricingTable {
    /// Published list prices of a typical managed document store.
    pub fn factory_default() -> Self {
        Self {
            reads: ResourcePricing {
                unit_size: 100_000.0,
                price_per_unit: 0.036,
                free_allowance: 50_000.0,
            },
            rule_evaluations: ResourcePricing {
                unit_size: 100_000.0,
                price_per_unit: 0.018,
                free_allowance: 50_000.0,
            },
            storage: ResourcePricing {
                unit_size: 1.0,
                price_per_unit: 0.18,
                free_allowance: 1.0,
            },
            bandwidth: ResourcePricing {
                unit_size: 1.0,
                price_per_unit: 0.15,
                free_allowance: 0.36,
            },
        }
    }

    pub fn validate(&self) -> TallyResult<()> {
        self.reads.validate("pricing.reads")?;
        self.rule_evaluations.validate("pricing.rule_evaluations")?;
        self.storage.validate("pricing.storage")?;
        self.bandwidth.validate("pricing.bandwidth")?;
        Ok(())
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::factory_default()
    }
}

// ============================================================================
// COST MONITOR
// ============================================================================

/// Settings of the periodic cost monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// How often usage is aggregated and thresholds evaluated, in seconds.
    pub interval_secs: u64,
    /// Current stored data size, in GB.
    pub storage_gb: f64,
    /// Estimated daily egress, in GB.
    pub bandwidth_gb_per_day: f64,
    /// Capacity of the in-memory alert list.
    pub max_retained_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            storage_gb: 0.0,
            bandwidth_gb_per_day: 0.0,
            max_retained_alerts: 500,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> TallyResult<()> {
        if self.interval_secs == 0 {
            return Err(invalid(
                "interval_secs",
                self.interval_secs,
                "interval_secs must be positive",
            ));
        }
        if self.max_retained_alerts == 0 {
            return Err(invalid(
                "max_retained_alerts",
                self.max_retained_alerts,
                "max_retained_alerts must be greater than 0",
            ));
        }
        for (field, value) in [
            ("storage_gb", self.storage_gb),
            ("bandwidth_gb_per_day", self.bandwidth_gb_per_day),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, value, "must be a non-negative finite number"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct. Every section is required in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TallyConfig {
    pub optimization: OptimizationConfig,
    pub cache: CacheConfig,
    pub thresholds: CostThresholds,
    pub pricing: PricingTable,
    pub monitor: MonitorConfig,
}

impl TallyConfig {
    /// Build the documented factory configuration.
    pub fn factory_default() -> Self {
        Self {
            optimization: OptimizationConfig::default(),
            cache: CacheConfig::default(),
            thresholds: CostThresholds::factory_default(),
            pricing: PricingTable::factory_default(),
            monitor: MonitorConfig::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> TallyResult<Self> {
        let config: TallyConfig = toml::from_str(source).map_err(|e| {
            TallyError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: &Path) -> TallyResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TallyError::Config(ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate every section.
    pub fn validate(&self) -> TallyResult<()> {
        self.optimization.validate()?;
        self.cache.validate()?;
        self.thresholds.validate()?;
        self.pricing.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_default_is_valid() {
        assert!(TallyConfig::factory_default().validate().is_ok());
    }

    #[test]
    fn test_optimization_config_from_env() {
        // Only this test touches these variables.
        std::env::set_var("TALLY_MAX_BATCH_SIZE", "25");
        std::env::set_var("TALLY_CACHE_ENABLED", "false");
        std::env::set_var("TALLY_ENABLE_BATCH_READS", "yes");
        std::env::set_var("TALLY_REMOTE_TIMEOUT_MS", "soon");

        let config = OptimizationConfig::from_env();

        for key in [
            "TALLY_MAX_BATCH_SIZE",
            "TALLY_CACHE_ENABLED",
            "TALLY_ENABLE_BATCH_READS",
            "TALLY_REMOTE_TIMEOUT_MS",
        ] {
            std::env::remove_var(key);
        }

        assert_eq!(config.max_batch_size, 25);
        assert!(!config.cache_enabled);
        assert!(config.is_pass_through());
        assert!(config.enable_batch_reads);
        // Unparseable values fall back to the default.
        assert_eq!(config.remote_timeout_ms, OptimizationConfig::default().remote_timeout_ms);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = OptimizationConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            TallyError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "max_batch_size"
        ));
    }

    #[test]
    fn test_pass_through_disables_cache() {
        let config = OptimizationConfig::pass_through();
        assert!(config.is_pass_through());
        assert!(!config.enable_batch_reads);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let thresholds = CostThresholds {
            daily_budget: -1.0,
            ..CostThresholds::factory_default()
        };
        assert!(thresholds.validate().is_err());

        let thresholds = CostThresholds {
            cost_spike_percentage: 0.0,
            ..CostThresholds::factory_default()
        };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn test_persistent_layer_requires_path() {
        let config = CacheConfig {
            persistent_enabled: true,
            persistent_path: None,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TallyError::Config(ConfigError::MissingRequired { .. }))
        ));

        let config = CacheConfig::new().with_persistent("/tmp/tally-cache", 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_for_prefers_override() {
        let config = CacheConfig::new().with_ttl_override(DataType::Stats, Duration::from_secs(7));
        assert_eq!(config.ttl_for(DataType::Stats), Duration::from_secs(7));
        assert_eq!(config.ttl_for(DataType::Novel), DataType::Novel.default_ttl());
    }

    #[test]
    fn test_pricing_rejects_zero_unit_size() {
        let mut pricing = PricingTable::factory_default();
        pricing.reads.unit_size = 0.0;
        assert!(pricing.validate().is_err());
    }

    #[test]
    fn test_from_toml_str_roundtrips_factory_default() {
        let source = toml::to_string(&TallyConfig::factory_default()).unwrap();
        let parsed = TallyConfig::from_toml_str(&source).unwrap();
        assert_eq!(parsed, TallyConfig::factory_default());
    }

    #[test]
    fn test_from_toml_str_rejects_invalid_section() {
        let mut config = TallyConfig::factory_default();
        config.monitor.interval_secs = 0;
        let source = toml::to_string(&config).unwrap();
        assert!(TallyConfig::from_toml_str(&source).is_err());
    }

    #[test]
    fn test_from_toml_str_reports_parse_errors() {
        let err = TallyConfig::from_toml_str("optimization = 3").unwrap_err();
        assert!(matches!(err, TallyError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TallyConfig::from_path(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, TallyError::Config(ConfigError::Io { .. })));
    }
}
