//! Circuit breakers keyed by `step:category`.
//!
//! A breaker isolates a failing resource: after enough consecutive failures
//! it opens and rejects calls without running them, then lets a limited
//! number of trial calls through once the recovery timeout has elapsed.

mod breaker;
mod registry;

pub use breaker::{CircuitBreaker, StateObserver};
pub use registry::CircuitBreakerRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::classify::ErrorCategory;
use crate::config::{self, ConfigError};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without running
    Open,
    /// A limited number of trial calls are let through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Seconds after the last failure before probing
    pub recovery_timeout_seconds: f64,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Concurrent trial calls allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60.0,
            success_threshold: 2,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        config::seconds(self.recovery_timeout_seconds)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.success_threshold must be greater than 0".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.half_open_max_calls must be greater than 0".to_string(),
            ));
        }
        if !self.recovery_timeout_seconds.is_finite() || self.recovery_timeout_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.recovery_timeout_seconds must be a non-negative number"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Breaker configuration: a default plus per-category overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerConfig,
    pub per_category: HashMap<String, CircuitBreakerConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let mut per_category = HashMap::new();
        per_category.insert(
            ErrorCategory::Llm.as_str().to_string(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_seconds: 30.0,
                success_threshold: 1,
                half_open_max_calls: 1,
            },
        );
        per_category.insert(
            ErrorCategory::Database.as_str().to_string(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_seconds: 30.0,
                success_threshold: 2,
                half_open_max_calls: 1,
            },
        );
        per_category.insert(
            ErrorCategory::External.as_str().to_string(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout_seconds: 120.0,
                success_threshold: 2,
                half_open_max_calls: 2,
            },
        );
        Self {
            default: CircuitBreakerConfig::default(),
            per_category,
        }
    }
}

impl CircuitBreakerSettings {
    /// Config for a category, falling back to the default.
    pub fn for_category(&self, category: ErrorCategory) -> &CircuitBreakerConfig {
        self.per_category
            .get(category.as_str())
            .unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate()?;
        for (name, config) in &self.per_category {
            name.parse::<ErrorCategory>().map_err(ConfigError::Invalid)?;
            config.validate()?;
        }
        Ok(())
    }
}

/// Returned instead of running the operation when the circuit rejects a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit_name}' is open, retry in {recovery_time:?}")]
pub struct CircuitOpenError {
    pub circuit_name: String,
    /// Time left until the breaker will admit a trial call
    pub recovery_time: Duration,
}

/// Outcome of a protected call that did not succeed.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker rejected the call
    #[error(transparent)]
    Open(CircuitOpenError),
    /// The operation ran and failed
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Open(_) => None,
            CallError::Failed(e) => Some(e),
        }
    }
}

/// A state transition, handed to the registered observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub circuit_name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Lifetime counters of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
    /// Cumulative time spent open, including the current open period
    pub time_open: Duration,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change_at: Option<DateTime<Utc>>,
}

impl CircuitStats {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            state_changes: 0,
            time_open: Duration::ZERO,
            last_failure_at: None,
            last_success_at: None,
            last_state_change_at: None,
        }
    }

    /// Fraction of admitted calls that failed, 0.0 with no calls.
    pub fn failure_rate(&self) -> f64 {
        let completed = self.successful_calls + self.failed_calls;
        if completed == 0 {
            0.0
        } else {
            self.failed_calls as f64 / completed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_validate() {
        assert!(CircuitBreakerSettings::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_category_rejected() {
        let mut settings = CircuitBreakerSettings::default();
        settings
            .per_category
            .insert("gremlins".to_string(), CircuitBreakerConfig::default());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_for_category_falls_back_to_default() {
        let settings = CircuitBreakerSettings::default();
        assert_eq!(settings.for_category(ErrorCategory::Network), &settings.default);
        assert_eq!(settings.for_category(ErrorCategory::Llm).failure_threshold, 3);
    }

    #[test]
    fn test_call_error_accessors() {
        let open: CallError<String> = CallError::Open(CircuitOpenError {
            circuit_name: "a".into(),
            recovery_time: Duration::from_secs(1),
        });
        assert!(open.is_open());
        assert_eq!(open.into_inner(), None);

        let failed: CallError<String> = CallError::Failed("boom".into());
        assert_eq!(failed.to_string(), "boom");
        assert_eq!(failed.into_inner(), Some("boom".to_string()));
    }
}
