//! The five tier handlers.
//!
//! Each handler returns a [`TierOutcome`]; anything but `Success` makes the
//! engine escalate. An `Err` is an internal failure and is recorded as a
//! failed attempt.

use serde_json::json;
use tracing::{debug, info, warn};

use super::engine::RecoveryEngine;
use super::escalation::{DiagnosisRequest, IncidentReport};
use super::{
    Operation, RecoveryContext, RecoveryError, RecoveryResult, TierOutcome, TIER2_TOKEN_COST,
    TIER3_TOKEN_COST,
};
use crate::circuit::{CallError, CircuitBreaker};
use crate::classify::RecoveryTier;
use crate::fault::Fault;
use crate::memory::ResolutionStep;

/// Maps a protected call onto a tier outcome.
fn call_outcome<T>(
    result: Result<T, CallError<Fault>>,
    steps: Vec<ResolutionStep>,
) -> TierOutcome<T> {
    match result {
        Ok(value) => TierOutcome::success(Some(value), steps),
        Err(CallError::Open(e)) => TierOutcome::new(RecoveryResult::CircuitOpen)
            .with_steps(steps)
            .with_detail(e.to_string()),
        Err(CallError::Failed(fault)) => TierOutcome::new(RecoveryResult::Failure)
            .with_steps(steps)
            .with_detail(format!("retry failed: {fault}")),
    }
}

impl RecoveryEngine {
    pub(super) async fn run_tier<T: Send + 'static>(
        &self,
        tier: RecoveryTier,
        ctx: &mut RecoveryContext,
        op: Option<&Operation<T>>,
    ) -> Result<TierOutcome<T>, RecoveryError> {
        match tier {
            RecoveryTier::Tier0 => self.heuristic_triage(ctx, op).await,
            RecoveryTier::Tier1 => self.automatic_remediation(ctx, op).await,
            RecoveryTier::Tier2 => self.learned_resolution(ctx, op).await,
            RecoveryTier::Tier3 => self.agent_diagnosis(ctx, op).await,
            RecoveryTier::Tier4 => self.human_escalation(ctx).await,
        }
    }

    fn breaker_for(&self, ctx: &RecoveryContext) -> std::sync::Arc<CircuitBreaker> {
        self.breakers.get(&ctx.breaker_key(), None)
    }

    /// Tier 0: no remote calls. One immediate retry when the local cache
    /// holds an effective pattern whose fix is a plain retry.
    async fn heuristic_triage<T: Send + 'static>(
        &self,
        ctx: &mut RecoveryContext,
        op: Option<&Operation<T>>,
    ) -> Result<TierOutcome<T>, RecoveryError> {
        let breaker = self.breaker_for(ctx);
        if breaker.is_open() {
            return Ok(TierOutcome::new(RecoveryResult::CircuitOpen)
                .with_detail(format!("circuit '{}' is open", breaker.name())));
        }

        let Some(op) = op else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated).with_detail("no operation to retry"));
        };
        let Some(pattern) = self.store.cached_pattern(&ctx.signature_key()).await else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated).with_detail("no cached pattern"));
        };
        let min_rate = self.config.error_pattern_memory.storage.min_success_rate;
        if !pattern.is_effective(min_rate) || !pattern.has_simple_retry() {
            return Ok(TierOutcome::new(RecoveryResult::Escalated)
                .with_detail("cached pattern is not a proven simple retry"));
        }

        debug!(pattern = %pattern.id, "immediate retry from cached pattern");
        let steps = vec![ResolutionStep::new("immediate_retry", RecoveryTier::Tier0)
            .with_parameter("pattern_id", json!(pattern.id))];
        match breaker.call(|| op()).await {
            Ok(value) => Ok(TierOutcome::success(Some(value), steps)),
            Err(e) => Ok(TierOutcome::new(RecoveryResult::Escalated)
                .with_detail(format!("immediate retry failed: {e}"))),
        }
    }

    /// Runs every applicable remediation hook. Hook failures are logged and
    /// do not stop the tier.
    async fn run_hooks(&self, ctx: &mut RecoveryContext) -> Vec<ResolutionStep> {
        let mut steps = Vec::new();
        for hook in &self.hooks {
            if !hook.applies_to(&ctx.classification, &ctx.fault) {
                continue;
            }
            match hook.apply(ctx).await {
                Ok(outcome) if outcome.applied => {
                    debug!(hook = hook.name(), "remediation hook applied");
                    ctx.flags.extend(outcome.flags);
                    steps.extend(outcome.steps);
                }
                Ok(_) => {}
                Err(e) => warn!(hook = hook.name(), error = %e, "remediation hook failed"),
            }
        }
        steps
    }

    /// Tier 1: remediation hooks, then retry with exponential backoff
    /// through the breaker.
    async fn automatic_remediation<T: Send + 'static>(
        &self,
        ctx: &mut RecoveryContext,
        op: Option<&Operation<T>>,
    ) -> Result<TierOutcome<T>, RecoveryError> {
        if !ctx.classification.is_retriable {
            return Ok(TierOutcome::new(RecoveryResult::Skipped).with_detail("fault is not retriable"));
        }

        let mut steps = self.run_hooks(ctx).await;
        let Some(op) = op else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated)
                .with_steps(steps)
                .with_detail("no operation to retry"));
        };

        let breaker = self.breaker_for(ctx);
        let policy = self.config.retry.policy(ctx.classification.category);
        let mut last_error = None;

        for attempt in 0..policy.max_retries() {
            let delay = policy.delay(attempt);
            debug!(
                attempt = attempt + 1,
                max = policy.max_retries(),
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;

            match breaker.call(|| op()).await {
                Ok(value) => {
                    steps.push(
                        ResolutionStep::new("retry_with_backoff", RecoveryTier::Tier1)
                            .with_parameter("attempts", json!(attempt + 1)),
                    );
                    return Ok(TierOutcome::success(Some(value), steps));
                }
                Err(CallError::Open(e)) => {
                    return Ok(TierOutcome::new(RecoveryResult::CircuitOpen)
                        .with_steps(steps)
                        .with_detail(e.to_string()));
                }
                Err(CallError::Failed(fault)) => last_error = Some(fault),
            }
        }

        let detail = match last_error {
            Some(fault) => format!("{} retries failed, last error: {fault}", policy.max_retries()),
            None => "retries disabled".to_string(),
        };
        Ok(TierOutcome::new(RecoveryResult::Failure)
            .with_steps(steps)
            .with_detail(detail))
    }

    /// Tier 2: retry once, guided by the best learned pattern, and feed the
    /// outcome back to that pattern.
    async fn learned_resolution<T: Send + 'static>(
        &self,
        ctx: &mut RecoveryContext,
        op: Option<&Operation<T>>,
    ) -> Result<TierOutcome<T>, RecoveryError> {
        ctx.token_cost += TIER2_TOKEN_COST;
        ctx.pattern_matches = self
            .store
            .find_similar_patterns(&ctx.fault, Some(&ctx.classification), Some(&ctx.request_context))
            .await;

        let Some(best) = ctx.pattern_matches.first().cloned() else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated).with_detail("no similar patterns"));
        };
        let Some(op) = op else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated).with_detail("no operation to retry"));
        };

        debug!(
            pattern = %best.pattern.id,
            similarity = best.similarity_score,
            exact = best.is_exact_match,
            "retrying with learned resolution"
        );
        let result = self.breaker_for(ctx).call(|| op()).await;
        if !matches!(result, Err(CallError::Open(_))) {
            self.store
                .record_resolution_outcome(&best.pattern.id, result.is_ok())
                .await;
        }

        let mut steps = best.pattern.resolution_steps.clone();
        steps.push(
            ResolutionStep::new("apply_learned_resolution", RecoveryTier::Tier2)
                .with_parameter("pattern_id", json!(best.pattern.id))
                .with_parameter("similarity", json!(best.similarity_score)),
        );
        Ok(call_outcome(result, steps))
    }

    /// Tier 3: hand the fault to the diagnosis agent; retry if it reports a
    /// fix.
    async fn agent_diagnosis<T: Send + 'static>(
        &self,
        ctx: &mut RecoveryContext,
        op: Option<&Operation<T>>,
    ) -> Result<TierOutcome<T>, RecoveryError> {
        ctx.token_cost += TIER3_TOKEN_COST;
        let Some(agent) = &self.diagnosis else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated)
                .with_detail("no diagnosis agent configured"));
        };

        if ctx.pattern_matches.is_empty() {
            ctx.pattern_matches = self
                .store
                .find_similar_patterns(&ctx.fault, Some(&ctx.classification), Some(&ctx.request_context))
                .await;
        }

        let request = DiagnosisRequest::from_context(ctx, &self.config.tiers.tier_3.target_agent);
        info!(agent = %request.target_agent, code = %request.error_code, "requesting diagnosis");
        let Some(diagnosis) = agent.diagnose(&request).await? else {
            return Ok(TierOutcome::new(RecoveryResult::Escalated).with_detail("no diagnosis returned"));
        };

        ctx.diagnosis = Some(diagnosis.summary.clone());
        let steps = diagnosis.resolution_steps;
        if !diagnosis.resolved {
            return Ok(TierOutcome::new(RecoveryResult::Escalated)
                .with_steps(steps)
                .with_detail(diagnosis.summary));
        }

        match op {
            Some(op) => {
                let result = self.breaker_for(ctx).call(|| op()).await;
                Ok(call_outcome(result, steps))
            }
            None => Ok(TierOutcome::success(None, steps)),
        }
    }

    /// Tier 4: hand an incident report to the escalation sink. Never
    /// succeeds; the hand-off is bounded by the configured timeout.
    async fn human_escalation<T>(
        &self,
        ctx: &mut RecoveryContext,
    ) -> Result<TierOutcome<T>, RecoveryError> {
        let report = IncidentReport::from_context(ctx);
        let timeout = self.config.tiers.tier_4.handoff_timeout();

        let tracking_id = tokio::time::timeout(timeout, self.escalation.escalate(&report))
            .await
            .map_err(|_| RecoveryError::Timeout(timeout))??;

        info!(
            incident = %report.incident_id,
            tracking_id = tracking_id.as_deref().unwrap_or("-"),
            "incident escalated"
        );
        ctx.incident_tracking_id = tracking_id;
        Ok(TierOutcome::new(RecoveryResult::Escalated)
            .with_detail(format!("incident {}", report.incident_id)))
    }
}
