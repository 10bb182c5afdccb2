// Orchestrator configuration
// Loaded once at startup from JSON; provider descriptors may be reloaded later
// through the orchestrator without rebuilding the rest of the configuration.

use crate::descriptor::{validate_descriptors, ProviderDescriptor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub providers: Vec<ProviderDescriptor>,
    pub health: HealthConfig,
    pub aggregate: AggregateConfig,
    pub rotation: RotationConfig,
    pub attempt_log: AttemptLogConfig,
}

// Health tracking thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    // Cooldown trips once consecutive failures exceed this value
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    // Weight of the newest sample in the response time EMA
    pub latency_ema_weight: f64,
    pub probe_interval_secs: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 300,
            latency_ema_weight: 0.2,
            probe_interval_secs: None,
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    // Fan-out width when the query does not set max_providers
    pub default_max_providers: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            default_max_providers: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub round_robin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptLogConfig {
    pub channel_capacity: usize,
    pub write_timeout_ms: u64,
}

impl Default for AttemptLogConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            write_timeout_ms: 2000,
        }
    }
}

impl AttemptLogConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl OrchestratorConfig {
    pub fn with_providers(providers: Vec<ProviderDescriptor>) -> Self {
        Self {
            providers,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_descriptors(&self.providers)?;

        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health.cooldown_secs == 0 {
            return Err(ConfigError::Invalid(
                "health.cooldown_secs must be greater than zero".into(),
            ));
        }
        let weight = self.health.latency_ema_weight;
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "health.latency_ema_weight must be in (0, 1], got {}",
                weight
            )));
        }
        if self.health.probe_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "health.probe_interval_secs must be greater than zero".into(),
            ));
        }
        if self.aggregate.default_max_providers == 0 {
            return Err(ConfigError::Invalid(
                "aggregate.default_max_providers must be at least 1".into(),
            ));
        }
        if self.attempt_log.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "attempt_log.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
