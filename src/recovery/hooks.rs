//! Pre-remediation hooks run by Tier 1 before retrying.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info};

use super::{RecoveryContext, RecoveryError};
use crate::classify::{ContextMap, ErrorCategory, ErrorClassification, RecoveryTier};
use crate::fault::Fault;
use crate::memory::ResolutionStep;

static MISSING_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:no module named|cannot find module|module not found:?)\s+['"`]?([A-Za-z0-9_@/.\-]+?)['"`]?(?:\s|$|;|,)"#,
    )
    .expect("Invalid regex pattern")
});

/// What a hook did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutcome {
    pub applied: bool,
    pub steps: Vec<ResolutionStep>,
    /// Merged into [`RecoveryContext::flags`]
    pub flags: ContextMap,
}

impl HookOutcome {
    pub fn skipped() -> Self {
        Self::default()
    }

    /// An applied hook that raised `flag` and took `action`.
    pub fn flagged(flag: &str, action: &str) -> Self {
        let mut flags = ContextMap::new();
        flags.insert(flag.to_string(), serde_json::Value::Bool(true));
        Self {
            applied: true,
            steps: vec![ResolutionStep::new(action, RecoveryTier::Tier1)],
            flags,
        }
    }
}

/// Category-specific remediation applied before Tier 1 retries.
#[async_trait]
pub trait RemediationHook: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, classification: &ErrorClassification, fault: &Fault) -> bool;

    async fn apply(&self, ctx: &RecoveryContext) -> Result<HookOutcome, RecoveryError>;
}

fn has_hint(classification: &ErrorClassification, hint: &str) -> bool {
    classification.remediation_hints.iter().any(|h| h == hint)
}

/// Flags `truncate_context` on LLM context overflows so the caller can
/// shrink the prompt before the retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextTruncationHook;

#[async_trait]
impl RemediationHook for ContextTruncationHook {
    fn name(&self) -> &str {
        "context_truncation"
    }

    fn applies_to(&self, classification: &ErrorClassification, _fault: &Fault) -> bool {
        classification.category == ErrorCategory::Llm && has_hint(classification, "truncate_context")
    }

    async fn apply(&self, _ctx: &RecoveryContext) -> Result<HookOutcome, RecoveryError> {
        Ok(HookOutcome::flagged("truncate_context", "truncate_context"))
    }
}

/// Flags `refresh_token` on expired credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenRefreshHook;

#[async_trait]
impl RemediationHook for TokenRefreshHook {
    fn name(&self) -> &str {
        "token_refresh"
    }

    fn applies_to(&self, classification: &ErrorClassification, _fault: &Fault) -> bool {
        classification.category == ErrorCategory::Auth && has_hint(classification, "refresh_token")
    }

    async fn apply(&self, _ctx: &RecoveryContext) -> Result<HookOutcome, RecoveryError> {
        Ok(HookOutcome::flagged("refresh_token", "refresh_token"))
    }
}

/// Installs a package on request of the dependency hook.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, package: &str) -> Result<(), RecoveryError>;
}

/// Installs a missing module through a [`DependencyInstaller`].
///
/// Without an installer the hook only records which package is missing.
#[derive(Clone, Default)]
pub struct DependencyInstallHook {
    installer: Option<Arc<dyn DependencyInstaller>>,
}

impl DependencyInstallHook {
    pub fn new(installer: Option<Arc<dyn DependencyInstaller>>) -> Self {
        Self { installer }
    }

    /// Top-level package named in a missing-module message.
    pub fn missing_package(message: &str) -> Option<String> {
        let captured = MISSING_MODULE.captures(message)?.get(1)?.as_str();
        let package = if captured.starts_with('@') {
            // scoped npm package: keep "@scope/name"
            captured.splitn(3, '/').take(2).collect::<Vec<_>>().join("/")
        } else {
            captured
                .split(['.', '/'])
                .next()
                .unwrap_or(captured)
                .to_string()
        };
        (!package.is_empty()).then_some(package)
    }
}

#[async_trait]
impl RemediationHook for DependencyInstallHook {
    fn name(&self) -> &str {
        "dependency_install"
    }

    fn applies_to(&self, classification: &ErrorClassification, fault: &Fault) -> bool {
        classification.category == ErrorCategory::Dependency
            && Self::missing_package(fault.message()).is_some()
    }

    async fn apply(&self, ctx: &RecoveryContext) -> Result<HookOutcome, RecoveryError> {
        let Some(package) = Self::missing_package(ctx.fault.message()) else {
            return Ok(HookOutcome::skipped());
        };
        let Some(installer) = &self.installer else {
            debug!(package = %package, "no dependency installer configured");
            return Ok(HookOutcome::skipped());
        };

        installer.install(&package).await.map_err(|e| RecoveryError::Hook {
            hook: self.name().to_string(),
            message: e.to_string(),
        })?;
        info!(package = %package, "installed missing dependency");

        let mut flags = ContextMap::new();
        flags.insert(
            "installed_package".to_string(),
            serde_json::Value::String(package.clone()),
        );
        Ok(HookOutcome {
            applied: true,
            steps: vec![ResolutionStep::new("install_missing_dependency", RecoveryTier::Tier1)
                .with_parameter("package", serde_json::Value::String(package))],
            flags,
        })
    }
}

/// The built-in hooks, in the order Tier 1 runs them.
pub fn default_hooks(
    installer: Option<Arc<dyn DependencyInstaller>>,
) -> Vec<Arc<dyn RemediationHook>> {
    vec![
        Arc::new(ContextTruncationHook),
        Arc::new(TokenRefreshHook),
        Arc::new(DependencyInstallHook::new(installer)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClassifier;
    use crate::fault::ErrorKind;
    use crate::recovery::RecoveryRequest;
    use parking_lot::Mutex;

    fn context(kind: ErrorKind, message: &str) -> RecoveryContext {
        let fault = Fault::new(kind, message);
        let classifier = ErrorClassifier::new();
        let classification = classifier.classify(&fault, None);
        let signature = classifier.signature(&fault, &classification);
        RecoveryContext::new(fault, classification, signature, &RecoveryRequest::new())
    }

    #[derive(Default)]
    struct RecordingInstaller {
        installed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DependencyInstaller for RecordingInstaller {
        async fn install(&self, package: &str) -> Result<(), RecoveryError> {
            self.installed.lock().push(package.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_missing_package_extraction() {
        assert_eq!(
            DependencyInstallHook::missing_package("No module named 'yaml.constructor'"),
            Some("yaml".to_string())
        );
        assert_eq!(
            DependencyInstallHook::missing_package("Error: Cannot find module 'left-pad'"),
            Some("left-pad".to_string())
        );
        assert_eq!(
            DependencyInstallHook::missing_package("Cannot find module '@scope/pkg/lib/index.js'"),
            Some("@scope/pkg".to_string())
        );
        assert_eq!(DependencyInstallHook::missing_package("disk full"), None);
    }

    #[tokio::test]
    async fn test_context_truncation_hook() {
        let ctx = context(ErrorKind::RuntimeError, "maximum context length exceeded");
        let hook = ContextTruncationHook;
        assert!(hook.applies_to(&ctx.classification, &ctx.fault));
        let outcome = hook.apply(&ctx).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.flags["truncate_context"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_token_refresh_hook_only_for_expired_tokens() {
        let hook = TokenRefreshHook;
        let expired = context(ErrorKind::RuntimeError, "session token expired");
        assert!(hook.applies_to(&expired.classification, &expired.fault));

        let denied = context(ErrorKind::PermissionDenied, "Permission denied");
        assert!(!hook.applies_to(&denied.classification, &denied.fault));
    }

    #[tokio::test]
    async fn test_dependency_hook_drives_installer() {
        let installer = Arc::new(RecordingInstaller::default());
        let hook = DependencyInstallHook::new(Some(installer.clone()));
        let ctx = context(ErrorKind::ModuleNotFound, "No module named 'requests'");

        assert!(hook.applies_to(&ctx.classification, &ctx.fault));
        let outcome = hook.apply(&ctx).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.steps[0].action, "install_missing_dependency");
        assert_eq!(*installer.installed.lock(), vec!["requests".to_string()]);
    }

    #[tokio::test]
    async fn test_dependency_hook_without_installer_is_skipped() {
        let hook = DependencyInstallHook::new(None);
        let ctx = context(ErrorKind::ModuleNotFound, "No module named 'requests'");
        let outcome = hook.apply(&ctx).await.unwrap();
        assert!(!outcome.applied);
    }

    #[test]
    fn test_default_hooks_order() {
        let names: Vec<String> = default_hooks(None)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, ["context_truncation", "token_refresh", "dependency_install"]);
    }
}
