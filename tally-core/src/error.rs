//! Error types for Tally operations

use crate::CacheLayerKind;
use thiserror::Error;

/// Cache layer errors.
///
/// These never reach end users: the cache manager recovers from them by
/// degrading to the remaining layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache layer {layer:?} unavailable: {reason}")]
    LayerUnavailable { layer: CacheLayerKind, reason: String },

    #[error("Cache layer {layer:?} is over its capacity ceiling")]
    QuotaExceeded { layer: CacheLayerKind },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Deserialization failed for key {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Remote document store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network failure reading {collection}: {reason}")]
    Network { collection: String, reason: String },

    #[error("Permission denied reading {collection}")]
    PermissionDenied { collection: String },

    #[error("Remote call on {collection} timed out after {timeout_ms}ms")]
    Timeout { collection: String, timeout_ms: u64 },

    #[error("Query rejected by {collection}: {reason}")]
    InvalidQuery { collection: String, reason: String },

    #[error("Remote store error: {reason}")]
    Other { reason: String },
}

/// Analytics sink errors. Always swallowed by the tracker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Sink {sink} rejected event {event}: {reason}")]
    SinkFailed {
        sink: String,
        event: String,
        reason: String,
    },

    #[error("Metric registration failed for {metric}: {reason}")]
    Registration { metric: String, reason: String },

    #[error("Subscriber initialization failed: {reason}")]
    SubscriberInit { reason: String },

    #[error("Report export failed: {reason}")]
    Export { reason: String },
}

/// Validation errors on caller-supplied input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors. Raised at construction time, never per call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Tally errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TallyError {
    /// Returns true if this error came from a remote call that timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TallyError::Remote(RemoteError::Timeout { .. }))
    }
}

/// Result type alias for Tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
