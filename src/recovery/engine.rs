use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::escalation::{DiagnosisAgent, EscalationSink, LoggingEscalationSink, WebhookEscalationSink};
use super::hooks::{default_hooks, DependencyInstaller, RemediationHook};
use super::{
    Operation, RecoveryContext, RecoveryError, RecoveryOutcome, RecoveryRequest, RecoveryResult,
    TierAttempt, TierOutcome,
};
use crate::circuit::{CircuitBreakerRegistry, CircuitStats, StateChange, StateObserver};
use crate::classify::{ErrorClassifier, RecoveryTier};
use crate::config::RecoveryConfig;
use crate::fault::Fault;
use crate::loop_guard::LoopProtector;
use crate::memory::ErrorPatternStore;
use crate::metrics::RecoveryMetrics;

/// Drives a fault through the recovery tiers.
///
/// Every collaborator is owned by the engine instance; share the engine
/// behind an `Arc` to recover from many tasks at once.
pub struct RecoveryEngine {
    pub(super) config: RecoveryConfig,
    pub(super) classifier: ErrorClassifier,
    pub(super) breakers: Arc<CircuitBreakerRegistry>,
    pub(super) store: Arc<ErrorPatternStore>,
    pub(super) loop_guard: Arc<LoopProtector>,
    pub(super) metrics: RecoveryMetrics,
    pub(super) hooks: Vec<Arc<dyn RemediationHook>>,
    pub(super) diagnosis: Option<Arc<dyn DiagnosisAgent>>,
    pub(super) escalation: Arc<dyn EscalationSink>,
}

impl RecoveryEngine {
    /// Engine with default collaborators for `config`.
    pub fn new(config: RecoveryConfig) -> Result<Self, RecoveryError> {
        Self::builder(config).build()
    }

    pub fn builder(config: RecoveryConfig) -> RecoveryEngineBuilder {
        RecoveryEngineBuilder::new(config)
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn pattern_store(&self) -> &Arc<ErrorPatternStore> {
        &self.store
    }

    pub fn loop_guard(&self) -> &Arc<LoopProtector> {
        &self.loop_guard
    }

    pub fn metrics(&self) -> &RecoveryMetrics {
        &self.metrics
    }

    /// Stats of every breaker created so far.
    pub fn circuit_stats(&self) -> HashMap<String, CircuitStats> {
        self.breakers.get_all_stats()
    }

    /// Drops stale patterns and expired loop-detection windows. Returns the
    /// number of patterns removed.
    pub async fn run_maintenance(&self) -> usize {
        self.loop_guard.prune_expired();
        self.store.cleanup_stale_patterns().await
    }

    /// Attempts to recover from `fault`.
    ///
    /// Tiers run in increasing order from the classification's suggested
    /// tier up to `request.max_tier`; the first success ends the call.
    /// `operation` is what the tiers retry; without it only the non-retry
    /// parts of each tier run. Never fails: internal errors are recorded as
    /// failed attempts.
    ///
    /// When no tier succeeds the result reflects how the last attempt ended:
    /// `Escalated` if Tier 4 handed the incident off, `CircuitOpen` if the
    /// breaker rejected the last call, `Failure` otherwise. A loop-protection
    /// block returns `LoopDetected` before any tier runs.
    pub async fn recover<T: Send + 'static>(
        &self,
        fault: Fault,
        request: RecoveryRequest,
        operation: Option<Operation<T>>,
    ) -> RecoveryOutcome<T> {
        let classification = self.classifier.classify(&fault, Some(&request.context));
        let signature = self.classifier.signature(&fault, &classification);
        let mut ctx = RecoveryContext::new(fault, classification, signature, &request);
        let signature_key = ctx.signature_key();

        let verdict = self
            .loop_guard
            .try_admit(&signature_key, request.workflow_id.as_deref());
        if let Some(reason) = verdict.reason() {
            warn!(signature = %signature_key, "recovery blocked: {}", reason);
            return self.finish(ctx, RecoveryResult::LoopDetected, RecoveryTier::Tier4, None);
        }

        info!(
            category = %ctx.classification.category,
            severity = %ctx.classification.severity,
            tier = %ctx.classification.suggested_tier,
            max_tier = %request.max_tier,
            code = %ctx.classification.error_code,
            workflow = ctx.workflow_id.as_deref().unwrap_or("-"),
            step = ctx.step_id.as_deref().unwrap_or("-"),
            "starting recovery"
        );

        let mut current = ctx.classification.suggested_tier;
        while current <= request.max_tier {
            let started_at = Utc::now();
            let started = Instant::now();

            let outcome = match self.run_tier(current, &mut ctx, operation.as_ref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(tier = %current, error = %e, "tier handler failed");
                    TierOutcome::new(RecoveryResult::Failure).with_detail(e.to_string())
                }
            };
            let succeeded = outcome.result == RecoveryResult::Success;
            self.metrics.record_tier_attempt(current, succeeded);
            ctx.record_attempt(TierAttempt {
                tier: current,
                result: outcome.result,
                started_at,
                duration: started.elapsed(),
                resolution_steps: outcome.steps.clone(),
                detail: outcome.detail.clone(),
            });

            if succeeded {
                if current >= RecoveryTier::Tier1 {
                    self.store
                        .store_pattern(
                            &ctx.fault,
                            &outcome.steps,
                            true,
                            Some(&ctx.classification),
                            Some(&ctx.request_context),
                        )
                        .await;
                }
                if let Some(workflow_id) = &ctx.workflow_id {
                    self.loop_guard.reset_workflow(workflow_id);
                }
                return self.finish(ctx, RecoveryResult::Success, current, outcome.value);
            }

            debug!(
                tier = %current,
                result = %outcome.result,
                detail = outcome.detail.as_deref().unwrap_or("-"),
                "tier did not recover"
            );
            match current.next() {
                Some(next) if next <= request.max_tier => {
                    ctx.tier_escalations += 1;
                    if let Some(workflow_id) = &ctx.workflow_id {
                        self.loop_guard.record_escalation(workflow_id);
                    }
                    current = next;
                }
                _ => break,
            }
        }

        let (result, final_tier) = match ctx.last_attempt() {
            Some(last) if last.tier == RecoveryTier::Tier4 && last.result == RecoveryResult::Escalated => {
                (RecoveryResult::Escalated, last.tier)
            }
            Some(last) if last.result == RecoveryResult::CircuitOpen => {
                (RecoveryResult::CircuitOpen, last.tier)
            }
            Some(last) => (RecoveryResult::Failure, last.tier),
            None => (RecoveryResult::Failure, request.max_tier),
        };
        self.finish(ctx, result, final_tier, None)
    }

    fn finish<T>(
        &self,
        ctx: RecoveryContext,
        result: RecoveryResult,
        final_tier: RecoveryTier,
        value: Option<T>,
    ) -> RecoveryOutcome<T> {
        let duration = ctx.elapsed();
        self.metrics.record_recovery(
            result,
            final_tier,
            ctx.classification.category,
            duration,
            ctx.token_cost,
        );

        let success = result == RecoveryResult::Success;
        if success {
            info!(
                tier = %final_tier,
                attempts = ctx.attempts.len(),
                duration_ms = duration.as_millis() as u64,
                "recovered"
            );
        } else {
            warn!(
                result = %result,
                tier = %final_tier,
                attempts = ctx.attempts.len(),
                escalations = ctx.tier_escalations,
                "recovery did not succeed"
            );
        }

        let error = (!success).then(|| ctx.fault.clone());
        RecoveryOutcome {
            success,
            final_tier,
            result,
            context: ctx,
            recovery_value: value,
            error,
        }
    }
}

/// Builder for [`RecoveryEngine`]. Unset collaborators come from config.
pub struct RecoveryEngineBuilder {
    config: RecoveryConfig,
    classifier: Option<ErrorClassifier>,
    store: Option<Arc<ErrorPatternStore>>,
    metrics: Option<RecoveryMetrics>,
    hooks: Option<Vec<Arc<dyn RemediationHook>>>,
    extra_hooks: Vec<Arc<dyn RemediationHook>>,
    installer: Option<Arc<dyn DependencyInstaller>>,
    diagnosis: Option<Arc<dyn DiagnosisAgent>>,
    escalation: Option<Arc<dyn EscalationSink>>,
}

impl RecoveryEngineBuilder {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            classifier: None,
            store: None,
            metrics: None,
            hooks: None,
            extra_hooks: Vec::new(),
            installer: None,
            diagnosis: None,
            escalation: None,
        }
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn pattern_store(mut self, store: Arc<ErrorPatternStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares an existing collector, e.g. with another engine.
    pub fn metrics(mut self, metrics: RecoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces the built-in remediation hooks.
    pub fn hooks(mut self, hooks: Vec<Arc<dyn RemediationHook>>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Adds a hook after the built-in (or replaced) ones.
    pub fn hook(mut self, hook: Arc<dyn RemediationHook>) -> Self {
        self.extra_hooks.push(hook);
        self
    }

    pub fn dependency_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn diagnosis_agent(mut self, agent: Arc<dyn DiagnosisAgent>) -> Self {
        self.diagnosis = Some(agent);
        self
    }

    pub fn escalation_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = Some(sink);
        self
    }

    /// Validates the config and wires the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or an HTTP collaborator
    /// named in it cannot be created.
    pub fn build(self) -> Result<RecoveryEngine, RecoveryError> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(ErrorPatternStore::from_config(
                self.config.error_pattern_memory.clone(),
            )?),
        };

        let metrics = self.metrics.unwrap_or_default();
        let observed = metrics.clone();
        let observer: StateObserver =
            Arc::new(move |change: &StateChange| observed.record_state_change(change));
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(self.config.circuit_breaker.clone()).with_observer(observer),
        );

        let mut hooks = self
            .hooks
            .unwrap_or_else(|| default_hooks(self.installer.clone()));
        hooks.extend(self.extra_hooks);

        let escalation: Arc<dyn EscalationSink> = match self.escalation {
            Some(sink) => sink,
            None => match &self.config.tiers.tier_4.escalation_target {
                Some(url) => Arc::new(WebhookEscalationSink::new(url.clone())?),
                None => Arc::new(LoggingEscalationSink),
            },
        };

        Ok(RecoveryEngine {
            classifier: self.classifier.unwrap_or_default(),
            loop_guard: Arc::new(LoopProtector::new(self.config.loop_protection.clone())),
            config: self.config,
            breakers,
            store,
            metrics,
            hooks,
            diagnosis: self.diagnosis,
            escalation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::fault::ErrorKind;
    use crate::recovery::operation;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(RecoveryConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_retry() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = operation(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Fault>("ok")
            }
        });

        let outcome = engine
            .recover(
                Fault::new(ErrorKind::ConnectionError, "Connection refused"),
                RecoveryRequest::new().with_step("fetch"),
                Some(op),
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.final_tier, RecoveryTier::Tier1);
        assert_eq!(outcome.recovery_value, Some("ok"));
        assert!(outcome.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics().snapshot().successful_recoveries, 1);
    }

    #[tokio::test]
    async fn test_suggested_tier_above_ceiling_fails_without_attempts() {
        let engine = engine();
        let outcome = engine
            .recover::<()>(
                Fault::new(ErrorKind::PermissionDenied, "Permission denied"),
                RecoveryRequest::new().with_max_tier(RecoveryTier::Tier1),
                None,
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.result, RecoveryResult::Failure);
        assert_eq!(outcome.final_tier, RecoveryTier::Tier1);
        assert!(outcome.context.attempts.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_auth_fault_escalates_to_human() {
        let engine = engine();
        let outcome = engine
            .recover::<()>(
                Fault::new(ErrorKind::PermissionDenied, "Permission denied"),
                RecoveryRequest::new().with_workflow("wf"),
                None,
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.result, RecoveryResult::Escalated);
        assert_eq!(outcome.final_tier, RecoveryTier::Tier4);
        let tiers: Vec<RecoveryTier> = outcome.context.attempts.iter().map(|a| a.tier).collect();
        assert_eq!(tiers, [RecoveryTier::Tier3, RecoveryTier::Tier4]);
        assert_eq!(outcome.context.token_cost, 500);
        assert_eq!(engine.loop_guard().escalation_count("wf"), 1);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = RecoveryConfig::default();
        config.retry.default.max_delay_seconds = 0.0;
        assert!(matches!(
            RecoveryEngine::new(config),
            Err(RecoveryError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_breaker_transitions_feed_metrics() {
        let engine = engine();
        let breaker = engine.breakers().get("step:database", None);
        let threshold = engine
            .config()
            .circuit_breaker
            .for_category(ErrorCategory::Database)
            .failure_threshold;
        for _ in 0..threshold {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        assert_eq!(
            engine.metrics().snapshot().circuit_transitions[&crate::circuit::CircuitState::Open],
            1
        );
    }
}
