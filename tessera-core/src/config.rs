//! Configuration for Tessera
//!
//! Configuration is layered with figment: `tessera.toml` in the working
//! directory, then the file named by `TESSERA_CONFIG_PATH`, then
//! `TESSERA_`-prefixed environment variables. Nested keys use a double
//! underscore, e.g. `TESSERA_PIPELINE__DEFAULT_TIMEOUT=5s`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TesseraError};
use crate::history::HistoryConfig;
use crate::pipeline::{CacheConfig, RateLimitConfig, RetryPolicy};

/// Main Tessera configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Execution pipeline configuration
    pub pipeline: PipelineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Execution pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline for requests that do not carry their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Retry policy for requests that do not carry their own
    pub default_retry: RetryPolicy,

    /// Result cache settings
    pub cache: CacheConfig,

    /// Rate limit categories and assignments
    pub rate_limits: RateLimitConfig,

    /// Execution history settings
    pub history: HistoryConfig,

    /// Cap on in-flight capability invocations (unbounded when unset)
    pub max_concurrent: Option<usize>,

    /// Per-capability configuration handed to factories
    pub capabilities: HashMap<String, Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            default_retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            rate_limits: RateLimitConfig::default(),
            history: HistoryConfig::default(),
            max_concurrent: None,
            capabilities: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Check every field for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(invalid("pipeline.default_timeout must be greater than zero"));
        }
        if self.history.capacity == 0 {
            return Err(invalid("pipeline.history.capacity must be at least 1"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("pipeline.cache.max_entries must be at least 1"));
        }
        if self.max_concurrent == Some(0) {
            return Err(invalid("pipeline.max_concurrent must be at least 1 when set"));
        }
        if self
            .max_concurrent
            .is_some_and(|n| n > tokio::sync::Semaphore::MAX_PERMITS)
        {
            return Err(invalid(format!(
                "pipeline.max_concurrent must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }

        self.default_retry
            .validate()
            .map_err(|e| invalid(format!("pipeline.default_retry: {}", e)))?;
        self.rate_limits
            .validate()
            .map_err(|e| invalid(format!("pipeline.rate_limits: {}", e)))?;

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn invalid(message: impl Into<String>) -> TesseraError {
    TesseraError::Configuration(message.into())
}

impl TesseraConfig {
    /// Load configuration from the default locations and the environment
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new().merge(Toml::file("tessera.toml"));

        // Check for custom config path
        if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
            figment = merge_file(figment, Path::new(&path))?;
        }

        let config: TesseraConfig = figment
            .merge(Env::prefixed("TESSERA_").split("__"))
            .extract()
            .map_err(|e| {
                TesseraError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML, YAML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TesseraError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: TesseraConfig = merge_file(figment::Figment::new(), path)?
            .extract()
            .map_err(|e| {
                TesseraError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(source: &str) -> Result<Self> {
        use figment::providers::{Format, Toml};

        let config: TesseraConfig = figment::Figment::new()
            .merge(Toml::string(source))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()
    }
}

fn merge_file(figment: figment::Figment, path: &Path) -> Result<figment::Figment> {
    use figment::providers::{Format, Json, Toml, Yaml};

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        Some("yaml") | Some("yml") => Ok(figment.merge(Yaml::file(path))),
        Some("json") => Ok(figment.merge(Json::file(path))),
        _ => Err(TesseraError::Configuration(format!(
            "Unsupported configuration format: {}",
            path.display()
        ))),
    }
}
