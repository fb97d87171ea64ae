//! Telemetry and observability infrastructure
//!
//! TigerStyle: Explicit telemetry configuration with bounded resource usage.

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Default log level filter
const LOG_LEVEL_DEFAULT: &str = "info";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Log level filter (EnvFilter syntax)
    pub log_level: String,
    /// Whether to include span targets in output
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "selkie".to_string(),
            log_level: LOG_LEVEL_DEFAULT.to_string(),
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a new configuration with the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - `SELKIE_SERVICE_NAME`: Service name (default: "selkie")
    /// - `RUST_LOG`: Log level filter (default: "info")
    pub fn from_env() -> Self {
        let service_name =
            std::env::var("SELKIE_SERVICE_NAME").unwrap_or_else(|_| "selkie".to_string());

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| LOG_LEVEL_DEFAULT.to_string());

        Self {
            service_name,
            log_level,
            with_target: true,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// Call once at process startup. Returns an error if a subscriber is
/// already installed or the filter does not parse.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).map_err(|e| {
        Error::invalid_configuration("log_level", format!("bad filter directive: {}", e))
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| Error::internal(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}
