//! Configuration management for the restrictor.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RestrictorError, Result};

/// Prefix for environment overrides, e.g. `RESTRICTOR__RESTRICTOR__LIMIT=10`.
const ENV_PREFIX: &str = "RESTRICTOR";
const ENV_SEPARATOR: &str = "__";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Limiter parameters
    #[serde(default)]
    pub restrictor: RestrictorConfig,

    /// Reference store parameters
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging parameters
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictorConfig {
    /// Rolling window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum admissions per subject per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Number of buckets the window is divided into
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,

    /// Number of lock stripes serializing decisions per subject
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,
}

impl Default for RestrictorConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            limit: default_limit(),
            bucket_count: default_bucket_count(),
            lock_stripes: default_lock_stripes(),
        }
    }
}

impl RestrictorConfig {
    /// The rolling window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_window_ms() -> u64 {
    2000
}

fn default_limit() -> u64 {
    100
}

fn default_bucket_count() -> u32 {
    2
}

fn default_lock_stripes() -> usize {
    256
}

/// Reference store parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Internal map shard count (power of two), or the map's default
    #[serde(default)]
    pub shard_amount: Option<usize>,

    /// Interval between expired-counter sweeps in milliseconds; 0 disables sweeping
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Per-operation deadline in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_amount: None,
            sweep_interval_ms: default_sweep_interval(),
            timeout_ms: None,
        }
    }
}

impl StoreConfig {
    /// Sweep interval, or `None` if sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    /// Per-operation deadline, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_sweep_interval() -> u64 {
    1000
}

/// Logging parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RestrictorError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
