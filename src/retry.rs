//! Exponential backoff with jitter for Tier 1 retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::classify::ErrorCategory;
use crate::config::{self, ConfigError};

/// Backoff parameters for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_seconds: f64,
    /// Cap applied before jitter.
    pub max_delay_seconds: f64,
    /// Growth factor per attempt.
    pub exponential_base: f64,
    pub jitter: bool,
    /// Jitter spread as a percentage of the delay (0-100).
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_seconds: 1.0,
            max_delay_seconds: 60.0,
            exponential_base: 2.0,
            jitter: true,
            jitter_percent: 10.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.initial_delay_seconds >= 0.0 && self.initial_delay_seconds.is_finite()) {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_seconds must be a non-negative number".to_string(),
            ));
        }
        if !(self.max_delay_seconds >= self.initial_delay_seconds && self.max_delay_seconds.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_seconds ({}) must not be below initial_delay_seconds ({})",
                self.max_delay_seconds, self.initial_delay_seconds
            )));
        }
        if !(self.exponential_base >= 1.0 && self.exponential_base.is_finite()) {
            return Err(ConfigError::Invalid(
                "retry.exponential_base must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.jitter_percent) {
            return Err(ConfigError::Invalid(
                "retry.jitter_percent must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration: a default plus per-category overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub default: RetryConfig,
    pub per_category: HashMap<String, RetryConfig>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let mut per_category = HashMap::new();
        per_category.insert(
            ErrorCategory::Network.as_str().to_string(),
            RetryConfig {
                max_retries: 5,
                initial_delay_seconds: 0.5,
                max_delay_seconds: 30.0,
                ..Default::default()
            },
        );
        per_category.insert(
            ErrorCategory::Llm.as_str().to_string(),
            RetryConfig {
                max_retries: 5,
                initial_delay_seconds: 2.0,
                max_delay_seconds: 120.0,
                jitter_percent: 25.0,
                ..Default::default()
            },
        );
        per_category.insert(
            ErrorCategory::Database.as_str().to_string(),
            RetryConfig {
                max_retries: 3,
                initial_delay_seconds: 0.5,
                max_delay_seconds: 10.0,
                ..Default::default()
            },
        );
        Self {
            default: RetryConfig::default(),
            per_category,
        }
    }
}

impl RetrySettings {
    pub fn for_category(&self, category: ErrorCategory) -> &RetryConfig {
        self.per_category
            .get(category.as_str())
            .unwrap_or(&self.default)
    }

    /// Policy for a category.
    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        RetryPolicy::new(self.for_category(category).clone())
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

/// Computes retry delays from a [`RetryConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry `attempt` (0-based), without jitter:
    /// `min(initial * base^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.config.initial_delay_seconds * self.config.exponential_base.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.config.max_delay_seconds)
        } else {
            self.config.max_delay_seconds
        };
        config::seconds(capped)
    }

    /// Delay before retry `attempt` with jitter of up to ±`jitter_percent`,
    /// never negative.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if !self.config.jitter || self.config.jitter_percent <= 0.0 || base == 0.0 {
            return config::seconds(base);
        }

        let spread = base * self.config.jitter_percent / 100.0;
        let offset = rand::rng().random_range(-spread..=spread);
        config::seconds(base + offset)
    }

    /// The pre-jitter schedule for every configured retry.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.config.max_retries).map(|a| self.base_delay(a)).collect()
    }
}
