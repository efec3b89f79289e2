//! Collaborators for the upper tiers.
//!
//! Tier 3 hands a [`DiagnosisRequest`] to a [`DiagnosisAgent`]; Tier 4 hands
//! an [`IncidentReport`] to an [`EscalationSink`]. Both are traits so the
//! workflow engine can route them wherever it routes agent messages and
//! tickets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{RecoveryContext, RecoveryError, TierAttempt};
use crate::classify::{ErrorCategory, ErrorSeverity, RecoveryTier};
use crate::memory::{PatternMatch, ResolutionStep};

/// Matches included in diagnosis requests and incident reports.
const MAX_REPORTED_MATCHES: usize = 3;

/// Compact view of a pattern match for hand-off payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub pattern_id: String,
    pub similarity_score: f32,
    pub is_exact_match: bool,
    pub success_rate: f64,
    /// Actions of the stored resolution steps
    pub actions: Vec<String>,
}

impl From<&PatternMatch> for PatternSummary {
    fn from(m: &PatternMatch) -> Self {
        Self {
            pattern_id: m.pattern.id.clone(),
            similarity_score: m.similarity_score,
            is_exact_match: m.is_exact_match,
            success_rate: m.pattern.success_rate(),
            actions: m
                .pattern
                .resolution_steps
                .iter()
                .map(|s| s.action.clone())
                .collect(),
        }
    }
}

fn top_matches(ctx: &RecoveryContext) -> Vec<PatternSummary> {
    ctx.pattern_matches
        .iter()
        .take(MAX_REPORTED_MATCHES)
        .map(PatternSummary::from)
        .collect()
}

/// What Tier 3 sends to the diagnosis agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    pub target_agent: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub error_code: String,
    pub error_kind: String,
    pub message: String,
    pub suggested_tier: RecoveryTier,
    pub remediation_hints: Vec<String>,
    pub top_matches: Vec<PatternSummary>,
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub agent_name: Option<String>,
}

impl DiagnosisRequest {
    pub(crate) fn from_context(ctx: &RecoveryContext, target_agent: &str) -> Self {
        Self {
            target_agent: target_agent.to_string(),
            category: ctx.classification.category,
            severity: ctx.classification.severity,
            error_code: ctx.classification.error_code.clone(),
            error_kind: ctx.fault.kind().to_string(),
            message: ctx.fault.message().to_string(),
            suggested_tier: ctx.classification.suggested_tier,
            remediation_hints: ctx.classification.remediation_hints.clone(),
            top_matches: top_matches(ctx),
            workflow_id: ctx.workflow_id.clone(),
            step_id: ctx.step_id.clone(),
            agent_name: ctx.agent_name.clone(),
        }
    }
}

/// The diagnosis agent's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    #[serde(default)]
    pub resolution_steps: Vec<ResolutionStep>,
    /// The agent applied a fix and the operation is worth retrying
    #[serde(default)]
    pub resolved: bool,
}

/// Tier 3 collaborator.
#[async_trait]
pub trait DiagnosisAgent: Send + Sync {
    /// Returns `None` when the agent has nothing to offer.
    async fn diagnose(&self, request: &DiagnosisRequest)
        -> Result<Option<Diagnosis>, RecoveryError>;
}

/// What Tier 4 hands to a human.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentReport {
    pub incident_id: String,
    pub created_at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub error_code: String,
    pub error_kind: String,
    pub message: String,
    pub signature_key: String,
    pub remediation_hints: Vec<String>,
    pub attempts: Vec<TierAttempt>,
    pub duration_seconds: f64,
    pub token_cost: u64,
    pub pattern_matches: Vec<PatternSummary>,
    pub diagnosis: Option<String>,
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub agent_name: Option<String>,
}

impl IncidentReport {
    pub(crate) fn from_context(ctx: &RecoveryContext) -> Self {
        Self {
            incident_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            category: ctx.classification.category,
            severity: ctx.classification.severity,
            error_code: ctx.classification.error_code.clone(),
            error_kind: ctx.fault.kind().to_string(),
            message: ctx.fault.message().to_string(),
            signature_key: ctx.signature_key(),
            remediation_hints: ctx.classification.remediation_hints.clone(),
            attempts: ctx.attempts.clone(),
            duration_seconds: ctx.elapsed().as_secs_f64(),
            token_cost: ctx.token_cost,
            pattern_matches: top_matches(ctx),
            diagnosis: ctx.diagnosis.clone(),
            workflow_id: ctx.workflow_id.clone(),
            step_id: ctx.step_id.clone(),
            agent_name: ctx.agent_name.clone(),
        }
    }

    /// One-line title for tickets.
    pub fn title(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.severity.as_str().to_uppercase(),
            self.error_code,
            self.message
        )
    }
}

/// Tier 4 collaborator.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// Hands off the report. Returns a tracking id when the sink has one.
    async fn escalate(&self, report: &IncidentReport) -> Result<Option<String>, RecoveryError>;
}

/// Emits the report as a structured `error!` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEscalationSink;

#[async_trait]
impl EscalationSink for LoggingEscalationSink {
    async fn escalate(&self, report: &IncidentReport) -> Result<Option<String>, RecoveryError> {
        let attempts: Vec<String> = report
            .attempts
            .iter()
            .map(|a| format!("{}={}", a.tier, a.result))
            .collect();
        error!(
            incident = %report.incident_id,
            category = %report.category,
            severity = %report.severity,
            code = %report.error_code,
            workflow = report.workflow_id.as_deref().unwrap_or("-"),
            step = report.step_id.as_deref().unwrap_or("-"),
            attempts = %attempts.join(","),
            token_cost = report.token_cost,
            duration_s = report.duration_seconds,
            "escalating to human: {}",
            report.message
        );
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    #[serde(alias = "id", alias = "key", alias = "ticket_id")]
    tracking_id: Option<serde_json::Value>,
}

/// Posts incident reports as JSON to a webhook.
///
/// A JSON response carrying `tracking_id` (or `id`, `key`, `ticket_id`) is
/// returned as the tracking id; any other successful response yields `None`.
#[derive(Debug, Clone)]
pub struct WebhookEscalationSink {
    client: Client,
    url: String,
}

impl WebhookEscalationSink {
    pub fn new(url: impl Into<String>) -> Result<Self, RecoveryError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EscalationSink for WebhookEscalationSink {
    async fn escalate(&self, report: &IncidentReport) -> Result<Option<String>, RecoveryError> {
        let response = self.client.post(&self.url).json(report).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RecoveryError::Collaborator(format!(
                "HTTP {} error: {}",
                status, error_text
            )));
        }

        let body = response.text().await?;
        let tracking_id = serde_json::from_str::<WebhookResponse>(&body)
            .ok()
            .and_then(|r| r.tracking_id)
            .map(|id| match id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
        Ok(tracking_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClassifier;
    use crate::fault::{ErrorKind, Fault};
    use crate::recovery::{RecoveryRequest, RecoveryResult};
    use std::time::Duration;

    fn context() -> RecoveryContext {
        let fault = Fault::new(ErrorKind::PermissionDenied, "Permission denied");
        let classifier = ErrorClassifier::new();
        let classification = classifier.classify(&fault, None);
        let signature = classifier.signature(&fault, &classification);
        RecoveryContext::new(
            fault,
            classification,
            signature,
            &RecoveryRequest::new().with_workflow("wf").with_step("deploy"),
        )
    }

    #[test]
    fn test_incident_report_from_context() {
        let mut ctx = context();
        ctx.token_cost = 500;
        ctx.record_attempt(TierAttempt {
            tier: RecoveryTier::Tier3,
            result: RecoveryResult::Escalated,
            started_at: Utc::now(),
            duration: Duration::from_millis(5),
            resolution_steps: Vec::new(),
            detail: None,
        });

        let report = IncidentReport::from_context(&ctx);
        assert_eq!(report.category, ErrorCategory::Auth);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.token_cost, 500);
        assert_eq!(report.step_id.as_deref(), Some("deploy"));
        assert!(report.title().starts_with("[HIGH] AUTH_PermissionDenied"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["category"], "auth");
        assert_eq!(json["attempts"][0]["result"], "escalated");
    }

    #[test]
    fn test_diagnosis_request_from_context() {
        let ctx = context();
        let request = DiagnosisRequest::from_context(&ctx, "diagnostic_agent");
        assert_eq!(request.target_agent, "diagnostic_agent");
        assert_eq!(request.error_kind, "PermissionDenied");
        assert!(request.top_matches.is_empty());
    }

    #[test]
    fn test_diagnosis_defaults() {
        let diagnosis: Diagnosis = serde_json::from_str(r#"{"summary":"bad key"}"#).unwrap();
        assert!(!diagnosis.resolved);
        assert!(diagnosis.resolution_steps.is_empty());
    }

    #[tokio::test]
    async fn test_logging_sink_has_no_tracking_id() {
        let report = IncidentReport::from_context(&context());
        let id = LoggingEscalationSink.escalate(&report).await.unwrap();
        assert!(id.is_none());
    }
}
