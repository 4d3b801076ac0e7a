//! Deployer configuration.
//!
//! Loaded from YAML (for example a mounted ConfigMap) or from environment
//! variables. Every field has a default, so an empty document is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::conflict::Tier;

const ENV_WORKER_CONCURRENCY: &str = "DEPLOYER_WORKER_CONCURRENCY";
const ENV_TICK_INTERVAL_MS: &str = "DEPLOYER_TICK_INTERVAL_MS";
const ENV_FIELD_MANAGER: &str = "DEPLOYER_FIELD_MANAGER";
const ENV_DEFAULT_TIER: &str = "DEPLOYER_DEFAULT_TIER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level deployer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployerConfig {
    /// Maximum number of deployment handlers running at once
    pub worker_concurrency: usize,

    /// How often the scheduler moves queued work onto free workers
    pub tick_interval_ms: u64,

    /// Field manager used for server-side apply
    pub field_manager: String,

    /// Tier assumed for profiles that do not declare one
    pub default_tier: u32,

    pub retry: RetrySettings,
}

/// Retry settings for optimistic-concurrency conflicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 10,
            tick_interval_ms: 1000,
            field_manager: "application/apply-patch".to_string(),
            default_tier: Tier::DEFAULT.value(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            multiplier: 1.0,
            jitter: 0.1,
        }
    }
}

impl DeployerConfig {
    /// Parse and validate a YAML configuration document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from environment variables, falling back to defaults.
    ///
    /// Unparseable values are logged and ignored; parseable but invalid
    /// values (a zero tick interval, say) are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_parse::<usize>(ENV_WORKER_CONCURRENCY) {
            config.worker_concurrency = value;
        }
        if let Some(value) = env_parse::<u64>(ENV_TICK_INTERVAL_MS) {
            config.tick_interval_ms = value;
        }
        if let Ok(value) = std::env::var(ENV_FIELD_MANAGER) {
            if !value.trim().is_empty() {
                config.field_manager = value;
            }
        }
        if let Some(value) = env_parse::<u32>(ENV_DEFAULT_TIER) {
            config.default_tier = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "workerConcurrency must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tickIntervalMs must be at least 1".to_string(),
            ));
        }
        if self.field_manager.trim().is_empty() {
            return Err(ConfigError::Invalid("fieldManager cannot be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier cannot be below 1.0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn default_tier(&self) -> Tier {
        Tier::new(self.default_tier)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}
