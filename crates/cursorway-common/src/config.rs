//! Configuration for cursorway services
//!
//! Settings are layered: built-in defaults, then an optional TOML/YAML/JSON file,
//! then `<PREFIX>__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment prefix used by the gateway binary
pub const ENV_PREFIX: &str = "CURSORWAY";

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listener settings
    pub http: HttpSettings,
    /// Cursor and row buffering settings
    pub cursors: CursorSettings,
    /// Embedded engine settings
    pub engine: EngineSettings,
    /// Logging settings
    pub telemetry: TelemetrySettings,
    /// Data sources registered at startup
    pub data_sources: Vec<DataSourceSettings>,
}

impl GatewayConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        load_layered(file, ENV_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSettings {
    /// Rows buffered per execution before the engine thread blocks
    pub row_buffer_capacity: usize,
    /// Cursors untouched for this long are closed (0 disables reaping)
    pub idle_timeout_secs: u64,
    /// How often the reaper runs
    pub cleanup_interval_secs: u64,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            row_buffer_capacity: 50,
            idle_timeout_secs: 1800,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// DuckDB worker threads per database (defaults to CPU count)
    pub threads: Option<usize>,
    /// DuckDB memory limit, e.g. "4GB"
    pub memory_limit: Option<String>,
    /// Maximum rows handed to a sink in one delivery
    pub batch_rows: usize,
    /// How long commit/rollback wait for a busy connection
    pub control_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            threads: None,
            memory_limit: None,
            batch_rows: 1024,
            control_timeout_secs: 30,
        }
    }
}

/// Telemetry/observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

/// A data source registered from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSettings {
    pub name: String,
    /// Database path, or `:memory:`
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
}

/// Load configuration from an optional file and prefixed environment variables
pub fn load_layered<T: for<'de> Deserialize<'de>>(
    file: Option<&Path>,
    prefix: &str,
) -> Result<T, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder
        .add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
