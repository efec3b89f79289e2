use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use super::{RecoveryRequest, RecoveryResult};
use crate::classify::{ContextMap, ErrorClassification, ErrorSignature, RecoveryTier};
use crate::fault::Fault;
use crate::memory::{PatternMatch, ResolutionStep};

/// One tier handler run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierAttempt {
    pub tier: RecoveryTier,
    pub result: RecoveryResult,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub resolution_steps: Vec<ResolutionStep>,
    /// Why the handler ended the way it did, when there is more to say
    pub detail: Option<String>,
}

/// Everything known about one `recover()` call.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub fault: Fault,
    pub classification: ErrorClassification,
    pub signature: ErrorSignature,
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub agent_name: Option<String>,
    pub request_context: ContextMap,
    pub attempts: Vec<TierAttempt>,
    pub pattern_matches: Vec<PatternMatch>,
    pub tier_escalations: u32,
    /// Flags set by remediation hooks, e.g. `truncate_context`
    pub flags: ContextMap,
    /// Estimated tokens spent by tiers 2 and 3
    pub token_cost: u64,
    /// Diagnosis summary from Tier 3
    pub diagnosis: Option<String>,
    /// Ticket id returned by the escalation sink
    pub incident_tracking_id: Option<String>,
    pub start_time: DateTime<Utc>,
    started: Instant,
}

impl RecoveryContext {
    pub(crate) fn new(
        fault: Fault,
        classification: ErrorClassification,
        signature: ErrorSignature,
        request: &RecoveryRequest,
    ) -> Self {
        Self {
            fault,
            classification,
            signature,
            workflow_id: request.workflow_id.clone(),
            step_id: request.step_id.clone(),
            agent_name: request.agent_name.clone(),
            request_context: request.context.clone(),
            attempts: Vec::new(),
            pattern_matches: Vec::new(),
            tier_escalations: 0,
            flags: ContextMap::new(),
            token_cost: 0,
            diagnosis: None,
            incident_tracking_id: None,
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Breaker key for the failing resource: `"{step_id}:{category}"`, with
    /// `global` standing in for a missing step.
    pub fn breaker_key(&self) -> String {
        format!(
            "{}:{}",
            self.step_id.as_deref().unwrap_or("global"),
            self.classification.category
        )
    }

    pub fn signature_key(&self) -> String {
        self.signature.to_key()
    }

    /// Time since the call started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn last_attempt(&self) -> Option<&TierAttempt> {
        self.attempts.last()
    }

    /// Whether a remediation hook set `name` to `true`.
    pub fn flag(&self, name: &str) -> bool {
        self.flags
            .get(name)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn record_attempt(&mut self, attempt: TierAttempt) {
        self.attempts.push(attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClassifier;
    use crate::fault::ErrorKind;

    fn context(request: &RecoveryRequest) -> RecoveryContext {
        let fault = Fault::new(ErrorKind::ConnectionError, "Connection refused");
        let classifier = ErrorClassifier::new();
        let classification = classifier.classify(&fault, None);
        let signature = classifier.signature(&fault, &classification);
        RecoveryContext::new(fault, classification, signature, request)
    }

    #[test]
    fn test_breaker_key() {
        let ctx = context(&RecoveryRequest::new().with_step("step1"));
        assert_eq!(ctx.breaker_key(), "step1:network");

        let ctx = context(&RecoveryRequest::new());
        assert_eq!(ctx.breaker_key(), "global:network");
    }

    #[test]
    fn test_flags() {
        let mut ctx = context(&RecoveryRequest::new());
        assert!(!ctx.flag("truncate_context"));
        ctx.flags
            .insert("truncate_context".to_string(), serde_json::json!(true));
        assert!(ctx.flag("truncate_context"));
    }

    #[test]
    fn test_request_fields_copied() {
        let request = RecoveryRequest::new()
            .with_workflow("wf-1")
            .with_agent("coder")
            .with_context("branch", serde_json::json!("main"));
        let ctx = context(&request);
        assert_eq!(ctx.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(ctx.agent_name.as_deref(), Some("coder"));
        assert_eq!(ctx.request_context["branch"], serde_json::json!("main"));
        assert!(ctx.attempts.is_empty());
    }
}
