use std::future::Future;
use std::sync::Arc;

use super::{operation, RecoveryEngine, RecoveryRequest};
use crate::classify::RecoveryTier;
use crate::fault::Fault;

/// Wraps operations so that cheap recovery happens transparently.
///
/// The first call runs unprotected. On failure the engine recovers with the
/// configured tier ceiling (Tier 1 by default); if that is not enough the
/// original fault is returned unchanged.
#[derive(Clone)]
pub struct RecoveryMiddleware {
    engine: Arc<RecoveryEngine>,
    request: RecoveryRequest,
}

impl RecoveryMiddleware {
    pub fn new(engine: Arc<RecoveryEngine>) -> Self {
        Self {
            engine,
            request: RecoveryRequest::new().with_max_tier(RecoveryTier::Tier1),
        }
    }

    pub fn with_max_tier(mut self, max_tier: RecoveryTier) -> Self {
        self.request.max_tier = max_tier;
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.request.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.request.step_id = Some(step_id.into());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.request.agent_name = Some(agent_name.into());
        self
    }

    pub fn max_tier(&self) -> RecoveryTier {
        self.request.max_tier
    }

    /// Runs `f`, recovering from its failure.
    pub async fn wrap<T, F, Fut>(&self, f: F) -> Result<T, Fault>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Fault>> + Send + 'static,
    {
        let op = operation(f);
        let fault = match op().await {
            Ok(value) => return Ok(value),
            Err(fault) => fault,
        };

        let outcome = self
            .engine
            .recover(fault.clone(), self.request.clone(), Some(op))
            .await;
        match (outcome.success, outcome.recovery_value) {
            (true, Some(value)) => Ok(value),
            _ => Err(outcome.error.unwrap_or(fault)),
        }
    }
}

/// Runs `f` with transparent recovery up to `max_tier`.
pub async fn with_recovery<T, F, Fut>(
    engine: &Arc<RecoveryEngine>,
    max_tier: RecoveryTier,
    f: F,
) -> Result<T, Fault>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Fault>> + Send + 'static,
{
    RecoveryMiddleware::new(Arc::clone(engine))
        .with_max_tier(max_tier)
        .wrap(f)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::fault::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> Arc<RecoveryEngine> {
        Arc::new(RecoveryEngine::new(RecoveryConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let middleware = RecoveryMiddleware::new(engine());
        assert_eq!(middleware.max_tier(), RecoveryTier::Tier1);
        let value = middleware.wrap(|| async { Ok::<_, Fault>(3) }).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_recovered() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_recovery(&engine(), RecoveryTier::Tier1, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Fault::new(ErrorKind::Timeout, "read timed out"))
                } else {
                    Ok("body")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "body");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fault_past_ceiling_is_reraised() {
        let middleware = RecoveryMiddleware::new(engine()).with_step("deploy");
        let err = middleware
            .wrap(|| async { Err::<(), _>(Fault::new(ErrorKind::PermissionDenied, "Permission denied")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::PermissionDenied);
        assert_eq!(err.message(), "Permission denied");
    }
}
