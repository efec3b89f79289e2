//! Loop protection for the recovery engine.
//!
//! Two safeguards stop futile recovery cycles: a sliding window over
//! occurrences of the same error signature, and a per-workflow budget of
//! tier escalations.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{self, ConfigError};

/// Verdict from the loop protector about whether recovery may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    /// Recovery may proceed
    Allowed,
    /// The same signature recurred too often within the window
    SignatureLoop {
        signature_key: String,
        occurrences: u32,
        window: Duration,
    },
    /// The workflow has used up its escalation budget
    EscalationBudgetExhausted { workflow_id: String, escalations: u32 },
}

impl LoopVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LoopVerdict::Allowed)
    }

    /// Human-readable reason if recovery is blocked.
    pub fn reason(&self) -> Option<String> {
        match self {
            LoopVerdict::Allowed => None,
            LoopVerdict::SignatureLoop {
                signature_key,
                occurrences,
                window,
            } => Some(format!(
                "signature {signature_key} seen {occurrences} times within {}s",
                window.as_secs_f64()
            )),
            LoopVerdict::EscalationBudgetExhausted {
                workflow_id,
                escalations,
            } => Some(format!(
                "workflow {workflow_id} reached {escalations} tier escalations"
            )),
        }
    }
}

/// Sliding-window settings for identical errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    pub window_seconds: f64,
    pub max_identical_errors: u32,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60.0,
            max_identical_errors: 3,
        }
    }
}

/// Configuration for the loop protector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopProtectionConfig {
    pub loop_detection: LoopDetectionConfig,
    pub max_tier_escalations_per_workflow: u32,
}

impl Default for LoopProtectionConfig {
    fn default() -> Self {
        Self {
            loop_detection: LoopDetectionConfig::default(),
            max_tier_escalations_per_workflow: 10,
        }
    }
}

impl LoopProtectionConfig {
    pub fn window(&self) -> Duration {
        config::seconds(self.loop_detection.window_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.loop_detection.window_seconds > 0.0 && self.loop_detection.window_seconds.is_finite()) {
            return Err(ConfigError::Invalid(
                "loop_protection.loop_detection.window_seconds must be positive".to_string(),
            ));
        }
        if self.loop_detection.max_identical_errors == 0 {
            return Err(ConfigError::Invalid(
                "loop_protection.loop_detection.max_identical_errors must be greater than 0"
                    .to_string(),
            ));
        }
        if self.max_tier_escalations_per_workflow == 0 {
            return Err(ConfigError::Invalid(
                "loop_protection.max_tier_escalations_per_workflow must be greater than 0"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracks signature occurrences and workflow escalations.
#[derive(Debug, Default)]
pub struct LoopProtector {
    config: LoopProtectionConfig,
    occurrences: DashMap<String, VecDeque<Instant>>,
    escalations: DashMap<String, u32>,
}

impl LoopProtector {
    pub fn new(config: LoopProtectionConfig) -> Self {
        Self {
            config,
            occurrences: DashMap::new(),
            escalations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LoopProtectionConfig {
        &self.config
    }

    /// Checks both safeguards without recording anything.
    pub fn check(&self, signature_key: &str, workflow_id: Option<&str>) -> LoopVerdict {
        let recent = self.recent_occurrences(signature_key, Instant::now());
        if recent >= self.config.loop_detection.max_identical_errors {
            return self.signature_loop(signature_key, recent);
        }
        self.budget_verdict(workflow_id)
    }

    /// Checks both safeguards and, if recovery may proceed, records the
    /// occurrence. The signature's window stays locked from the count to the
    /// push, so concurrent callers cannot all slip under the limit.
    pub fn try_admit(&self, signature_key: &str, workflow_id: Option<&str>) -> LoopVerdict {
        let now = Instant::now();
        let mut times = self
            .occurrences
            .entry(signature_key.to_string())
            .or_default();
        prune(&mut times, now, self.config.window());

        let recent = times.len() as u32;
        if recent >= self.config.loop_detection.max_identical_errors {
            return self.signature_loop(signature_key, recent);
        }
        let verdict = self.budget_verdict(workflow_id);
        if verdict.is_allowed() {
            times.push_back(now);
        }
        verdict
    }

    fn signature_loop(&self, signature_key: &str, occurrences: u32) -> LoopVerdict {
        tracing::warn!(
            signature = signature_key,
            occurrences,
            "error loop detected"
        );
        LoopVerdict::SignatureLoop {
            signature_key: signature_key.to_string(),
            occurrences,
            window: self.config.window(),
        }
    }

    fn budget_verdict(&self, workflow_id: Option<&str>) -> LoopVerdict {
        let Some(workflow_id) = workflow_id else {
            return LoopVerdict::Allowed;
        };
        let escalations = self.escalation_count(workflow_id);
        if escalations < self.config.max_tier_escalations_per_workflow {
            return LoopVerdict::Allowed;
        }
        tracing::warn!(
            workflow = workflow_id,
            escalations,
            "escalation budget exhausted"
        );
        LoopVerdict::EscalationBudgetExhausted {
            workflow_id: workflow_id.to_string(),
            escalations,
        }
    }

    /// Records one occurrence of a signature.
    pub fn record_occurrence(&self, signature_key: &str) {
        let now = Instant::now();
        let mut entry = self.occurrences.entry(signature_key.to_string()).or_default();
        prune(&mut entry, now, self.config.window());
        entry.push_back(now);
    }

    /// Bumps the workflow's escalation counter and returns the new count.
    pub fn record_escalation(&self, workflow_id: &str) -> u32 {
        let mut count = self.escalations.entry(workflow_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clears the workflow's escalation counter.
    pub fn reset_workflow(&self, workflow_id: &str) {
        self.escalations.remove(workflow_id);
    }

    pub fn escalation_count(&self, workflow_id: &str) -> u32 {
        self.escalations.get(workflow_id).map(|c| *c).unwrap_or(0)
    }

    /// Occurrences of a signature inside the current window.
    pub fn occurrence_count(&self, signature_key: &str) -> u32 {
        self.recent_occurrences(signature_key, Instant::now())
    }

    /// Drops signatures with no occurrence inside the window.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        let window = self.config.window();
        self.occurrences.retain(|_, times| {
            prune(times, now, window);
            !times.is_empty()
        });
    }

    pub fn clear(&self) {
        self.occurrences.clear();
        self.escalations.clear();
    }

    fn recent_occurrences(&self, signature_key: &str, now: Instant) -> u32 {
        match self.occurrences.get_mut(signature_key) {
            Some(mut times) => {
                prune(&mut times, now, self.config.window());
                times.len() as u32
            }
            None => 0,
        }
    }
}

fn prune(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = times.front() {
        if now.saturating_duration_since(*oldest) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
}
