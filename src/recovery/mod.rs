//! Tiered recovery orchestration.
//!
//! [`RecoveryEngine::recover`] classifies a fault, consults the loop
//! protector, then walks the recovery tiers from the suggested one up to the
//! caller's ceiling until one of them succeeds:
//!
//! | Tier | Handler | Cost |
//! |------|---------|------|
//! | 0 | heuristic triage from the local pattern cache | none |
//! | 1 | remediation hooks, then retry with backoff | none |
//! | 2 | retry guided by learned resolutions | ~50 tokens |
//! | 3 | agent-assisted diagnosis | ~500 tokens |
//! | 4 | human escalation | terminal |

mod context;
mod engine;
mod escalation;
mod hooks;
mod middleware;
mod tiers;

pub use context::{RecoveryContext, TierAttempt};
pub use engine::{RecoveryEngine, RecoveryEngineBuilder};
pub use escalation::{
    Diagnosis, DiagnosisAgent, DiagnosisRequest, EscalationSink, IncidentReport,
    LoggingEscalationSink, PatternSummary, WebhookEscalationSink,
};
pub use hooks::{
    default_hooks, ContextTruncationHook, DependencyInstallHook, DependencyInstaller,
    HookOutcome, RemediationHook, TokenRefreshHook,
};
pub use middleware::{with_recovery, RecoveryMiddleware};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::classify::{ContextMap, RecoveryTier};
use crate::config::ConfigError;
use crate::fault::Fault;
use crate::memory::MemoryError;

/// Estimated token cost of a Tier 2 run.
pub const TIER2_TOKEN_COST: u64 = 50;

/// Estimated token cost of a Tier 3 run.
pub const TIER3_TOKEN_COST: u64 = 500;

/// Future returned by an [`Operation`].
pub type OperationFuture<T> = BoxFuture<'static, Result<T, Fault>>;

/// A retryable operation. Called once per attempt; must be idempotent.
pub type Operation<T> = Arc<dyn Fn() -> OperationFuture<T> + Send + Sync>;

/// Wraps an async closure as an [`Operation`].
pub fn operation<T, F, Fut>(f: F) -> Operation<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Fault>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as OperationFuture<T>)
}

/// How a tier, or a whole recovery, ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryResult {
    Success,
    Failure,
    /// Handed on to a higher tier, or to a human at Tier 4
    Escalated,
    /// The breaker for the failing resource rejected the call
    CircuitOpen,
    /// Loop protection blocked the recovery
    LoopDetected,
    /// The tier does not apply to this fault
    Skipped,
}

impl RecoveryResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryResult::Success => "success",
            RecoveryResult::Failure => "failure",
            RecoveryResult::Escalated => "escalated",
            RecoveryResult::CircuitOpen => "circuit_open",
            RecoveryResult::LoopDetected => "loop_detected",
            RecoveryResult::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecoveryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal failure of a tier handler.
///
/// Never returned from `recover()`: the engine records it as a failed
/// attempt and escalates.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("collaborator failed: {0}")]
    Collaborator(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("remediation hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Caller-supplied scope of a recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryRequest {
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub agent_name: Option<String>,
    pub context: ContextMap,
    /// Highest tier that may be attempted
    pub max_tier: RecoveryTier,
}

impl Default for RecoveryRequest {
    fn default() -> Self {
        Self {
            workflow_id: None,
            step_id: None,
            agent_name: None,
            context: ContextMap::new(),
            max_tier: RecoveryTier::Tier4,
        }
    }
}

impl RecoveryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_max_tier(mut self, max_tier: RecoveryTier) -> Self {
        self.max_tier = max_tier;
        self
    }
}

/// Result of a `recover()` call.
#[derive(Debug)]
pub struct RecoveryOutcome<T> {
    pub success: bool,
    /// Last tier attempted, or the tier implied by the result
    pub final_tier: RecoveryTier,
    pub result: RecoveryResult,
    pub context: RecoveryContext,
    /// Value of the operation when a retry succeeded
    pub recovery_value: Option<T>,
    /// The original fault, on every non-success result
    pub error: Option<Fault>,
}

impl<T> RecoveryOutcome<T> {
    /// Converts into the recovered value or the original fault.
    pub fn into_result(self) -> Result<Option<T>, Fault> {
        match (self.success, self.error) {
            (true, _) => Ok(self.recovery_value),
            (false, Some(fault)) => Err(fault),
            (false, None) => Err(self.context.fault),
        }
    }
}

/// What a tier handler reports back to the engine.
#[derive(Debug)]
pub(crate) struct TierOutcome<T> {
    pub result: RecoveryResult,
    pub value: Option<T>,
    pub steps: Vec<crate::memory::ResolutionStep>,
    pub detail: Option<String>,
}

impl<T> TierOutcome<T> {
    pub fn new(result: RecoveryResult) -> Self {
        Self {
            result,
            value: None,
            steps: Vec::new(),
            detail: None,
        }
    }

    pub fn success(value: Option<T>, steps: Vec<crate::memory::ResolutionStep>) -> Self {
        Self {
            result: RecoveryResult::Success,
            value,
            steps,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<crate::memory::ResolutionStep>) -> Self {
        self.steps = steps;
        self
    }
}
