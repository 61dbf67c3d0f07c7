//! Tracing subscriber initialization
//!
//! Installs a global `tracing` subscriber with an env-driven filter and either
//! JSON or human-readable output. Safe to call more than once: the first
//! successful call wins and later calls are no-ops.

use once_cell::sync::OnceCell;
use tally_core::{TallyResult, TelemetryError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "tally_query=debug,tally_storage=info,tally_monitor=info,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("TALLY_SERVICE_NAME")
                .unwrap_or_else(|_| "tally".to_string()),
            environment: std::env::var("TALLY_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            json: std::env::var("TALLY_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(true),
            filter: std::env::var("TALLY_LOG_FILTER")
                .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter).map_err(|e| TelemetryError::SubscriberInit {
                reason: format!("invalid filter '{}': {}", self.filter, e),
            }),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over [`TelemetryConfig::filter`]. Fails when
/// another subscriber was installed by someone else first.
pub fn init_tracing(config: &TelemetryConfig) -> TallyResult<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = config.env_filter()?;
    let (json_layer, plain_layer) = if config.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(plain_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit {
            reason: e.to_string(),
        })?;
    let _ = INITIALIZED.set(());

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        json = config.json,
        "Telemetry initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_telemetry_config_default_service_name() {
        let _guard = EnvVarGuard::set("TALLY_SERVICE_NAME", None);
        assert_eq!(TelemetryConfig::default().service_name, "tally");
    }

    #[test]
    fn test_telemetry_config_json_from_env() {
        let _guard = EnvVarGuard::set("TALLY_LOG_JSON", Some("0"));
        assert!(!TelemetryConfig::default().json);
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let _guard = EnvVarGuard::set("RUST_LOG", None);
        let config = TelemetryConfig {
            filter: "tally=notalevel[".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.env_filter(),
            Err(TelemetryError::SubscriberInit { .. })
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TelemetryConfig {
            json: false,
            filter: "warn".to_string(),
            ..Default::default()
        };
        // Another test binary may own the global subscriber; only a repeat
        // call after our own success is guaranteed to be a no-op.
        if init_tracing(&config).is_ok() {
            assert!(init_tracing(&config).is_ok());
        }
    }
}
