//! Recovery configuration.
//!
//! Everything is optional: a missing key takes its default. Configuration
//! is loaded once, from a TOML file and/or `REMEDY__`-prefixed environment
//! variables (`REMEDY__RETRY__DEFAULT__MAX_RETRIES=5`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::circuit::CircuitBreakerSettings;
use crate::loop_guard::LoopProtectionConfig;
use crate::memory::PatternMemoryConfig;
use crate::retry::RetrySettings;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "REMEDY";

/// Fractional seconds as a `Duration`. Negative and NaN values become zero;
/// values past `Duration::MAX` saturate.
pub(crate) fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The path could not be converted to a string.
    #[error("invalid configuration path: {0}")]
    InvalidPath(String),

    /// Failed to parse or merge configuration sources.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the diagnosis tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tier3Config {
    /// Name of the agent diagnoses are addressed to
    pub target_agent: String,
}

impl Default for Tier3Config {
    fn default() -> Self {
        Self {
            target_agent: "diagnostic_agent".to_string(),
        }
    }
}

/// Settings for the human escalation tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tier4Config {
    /// Webhook URL incident reports are posted to. Logged only when unset.
    pub escalation_target: Option<String>,
    /// Upper bound on the hand-off to the escalation sink
    pub handoff_timeout_seconds: f64,
}

impl Default for Tier4Config {
    fn default() -> Self {
        Self {
            escalation_target: None,
            handoff_timeout_seconds: 10.0,
        }
    }
}

impl Tier4Config {
    pub fn handoff_timeout(&self) -> Duration {
        seconds(self.handoff_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub tier_3: Tier3Config,
    pub tier_4: Tier4Config,
}

/// Complete configuration of the recovery engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub loop_protection: LoopProtectionConfig,
    pub error_pattern_memory: PatternMemoryConfig,
    pub tiers: TiersConfig,
}

impl RecoveryConfig {
    /// Loads configuration from a TOML file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, can't be parsed, or
    /// fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| ConfigError::InvalidPath(path.display().to_string()))?;

        let config = Config::builder()
            .add_source(File::new(path_str, FileFormat::Toml))
            .add_source(Self::environment())
            .build()?;

        let config: RecoveryConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(Self::environment()).build()?;
        let config: RecoveryConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses an embedded TOML document. Environment is not consulted.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RecoveryConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    /// Rejects zero thresholds, inverted delays and out-of-range rates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.loop_protection.validate()?;
        self.error_pattern_memory.validate()?;
        if !(self.tiers.tier_4.handoff_timeout_seconds > 0.0
            && self.tiers.tier_4.handoff_timeout_seconds.is_finite())
        {
            return Err(ConfigError::Invalid(
                "tiers.tier_4.handoff_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
