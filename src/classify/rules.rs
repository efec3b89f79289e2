//! Rule tables used by the classifier.
//!
//! Two tables drive classification: a baseline keyed on the fault's kind and
//! payload, and an ordered list of message rules grouped by category. Rules
//! are matched against the lowercased message.

use regex::Regex;

use super::{ErrorCategory, ErrorSeverity, RecoveryTier};
use crate::fault::{ErrorKind, Fault};

/// Category precedence used to break ties between equally severe matches.
/// Earlier entries win.
pub const CATEGORY_PRECEDENCE: [ErrorCategory; 12] = [
    ErrorCategory::Auth,
    ErrorCategory::Llm,
    ErrorCategory::Mcp,
    ErrorCategory::Container,
    ErrorCategory::Database,
    ErrorCategory::Workflow,
    ErrorCategory::Vcs,
    ErrorCategory::Dependency,
    ErrorCategory::Resource,
    ErrorCategory::Config,
    ErrorCategory::Network,
    ErrorCategory::External,
];

fn precedence(category: ErrorCategory) -> usize {
    CATEGORY_PRECEDENCE
        .iter()
        .position(|c| *c == category)
        .unwrap_or(CATEGORY_PRECEDENCE.len())
}

/// A message rule: a regex plus the classification it implies.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    regex: Regex,
    category: ErrorCategory,
    severity: ErrorSeverity,
    tier: RecoveryTier,
    hints: Vec<String>,
}

impl ClassificationRule {
    /// Creates a new rule.
    ///
    /// # Panics
    /// Panics if the regex pattern is invalid.
    pub fn new(
        pattern: &str,
        category: ErrorCategory,
        severity: ErrorSeverity,
        tier: RecoveryTier,
        hints: &[&str],
    ) -> Self {
        Self::with_regex(
            Regex::new(pattern).expect("Invalid regex pattern"),
            category,
            severity,
            tier,
            hints,
        )
    }

    /// Creates a new rule with a pre-compiled regex.
    pub fn with_regex(
        regex: Regex,
        category: ErrorCategory,
        severity: ErrorSeverity,
        tier: RecoveryTier,
        hints: &[&str],
    ) -> Self {
        Self {
            regex,
            category,
            severity,
            tier,
            hints: hints.iter().map(|h| h.to_string()).collect(),
        }
    }

    /// The source pattern.
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn tier(&self) -> RecoveryTier {
        self.tier
    }

    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    /// Checks if this rule matches the (already lowercased) text.
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Whether this rule beats `other` when both match the same message.
    pub fn outranks(&self, other: &ClassificationRule) -> bool {
        self.severity > other.severity
            || (self.severity == other.severity
                && precedence(self.category) < precedence(other.category))
    }
}

/// Classification implied by a fault's kind or payload alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindBaseline {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub tier: RecoveryTier,
    pub hints: &'static [&'static str],
}

impl KindBaseline {
    const fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        tier: RecoveryTier,
        hints: &'static [&'static str],
    ) -> Self {
        Self {
            category,
            severity,
            tier,
            hints,
        }
    }
}

/// Default severity and tier for a category named only by a subsystem tag.
fn category_default(category: ErrorCategory) -> KindBaseline {
    use ErrorCategory::*;
    use ErrorSeverity::*;
    use RecoveryTier::*;
    match category {
        Network => KindBaseline::new(Network, Medium, Tier1, &["retry_with_backoff"]),
        Auth => KindBaseline::new(Auth, High, Tier3, &["verify_credentials"]),
        Resource => KindBaseline::new(Resource, High, Tier2, &["free_resources"]),
        Dependency => KindBaseline::new(Dependency, Medium, Tier1, &["install_missing_dependency"]),
        Llm => KindBaseline::new(Llm, Medium, Tier1, &["retry_with_backoff"]),
        Mcp => KindBaseline::new(Mcp, Medium, Tier2, &["restart_mcp_server"]),
        Container => KindBaseline::new(Container, High, Tier2, &["restart_container"]),
        Vcs => KindBaseline::new(Vcs, Medium, Tier2, &["check_repository_state"]),
        Config => KindBaseline::new(Config, Medium, Tier2, &["check_configuration"]),
        Workflow => KindBaseline::new(Workflow, High, Tier2, &["restore_previous_checkpoint"]),
        Database => KindBaseline::new(Database, High, Tier2, &["check_database_health"]),
        External => KindBaseline::new(External, Medium, Tier2, &["check_service_status"]),
    }
}

/// Baseline classification from the fault's kind, then HTTP status, then
/// subsystem tag. `None` when none of them is informative.
pub fn kind_baseline(fault: &Fault) -> Option<KindBaseline> {
    use ErrorCategory::*;
    use ErrorSeverity::*;
    use RecoveryTier::*;

    let by_kind = match fault.kind() {
        ErrorKind::ConnectionError
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::Timeout => Some(KindBaseline::new(
            Network,
            Medium,
            Tier1,
            &["retry_with_backoff"],
        )),
        ErrorKind::PermissionDenied => {
            Some(KindBaseline::new(Auth, High, Tier3, &["check_permissions"]))
        }
        ErrorKind::OutOfMemory | ErrorKind::FileNotFound | ErrorKind::OsError => Some(
            KindBaseline::new(Resource, High, Tier2, &["free_resources", "verify_file_path"]),
        ),
        ErrorKind::ModuleNotFound | ErrorKind::ImportError => Some(KindBaseline::new(
            Dependency,
            Medium,
            Tier1,
            &["install_missing_dependency"],
        )),
        ErrorKind::ValueError
        | ErrorKind::TypeError
        | ErrorKind::AttributeError
        | ErrorKind::KeyError => Some(KindBaseline::new(Config, Medium, Tier2, &["validate_input"])),
        ErrorKind::RuntimeError | ErrorKind::Unknown(_) => None,
    };
    if by_kind.is_some() {
        return by_kind;
    }

    let by_status = fault.payload().http_status.and_then(|status| match status {
        401 | 403 => Some(KindBaseline::new(Auth, High, Tier3, &["verify_credentials"])),
        408 | 429 | 502 | 503 | 504 => Some(KindBaseline::new(
            Network,
            Medium,
            Tier1,
            &["retry_with_backoff"],
        )),
        400 | 422 => Some(KindBaseline::new(Config, Medium, Tier2, &["validate_input"])),
        500..=599 => Some(KindBaseline::new(
            External,
            Medium,
            Tier2,
            &["check_service_status"],
        )),
        _ => None,
    });
    if by_status.is_some() {
        return by_status;
    }

    fault
        .payload()
        .subsystem
        .as_deref()
        .and_then(|tag| tag.parse::<ErrorCategory>().ok())
        .map(category_default)
}

/// Returns the built-in message rules, grouped by category.
pub fn default_rules() -> Vec<ClassificationRule> {
    use ErrorCategory::*;
    use ErrorSeverity::*;
    use RecoveryTier::*;
    type R = ClassificationRule;

    vec![
        // Network
        R::new(
            r"connection (refused|reset|timed ?out|aborted)",
            Network,
            Medium,
            Tier1,
            &["retry_with_backoff", "check_network_connectivity"],
        ),
        R::new(
            r"network (is )?unreachable|no route to host",
            Network,
            Medium,
            Tier1,
            &["check_network_connectivity"],
        ),
        R::new(
            r"(dns|name) resolution (failed|failure)|getaddrinfo failed|failure in name resolution",
            Network,
            Medium,
            Tier1,
            &["check_dns_configuration"],
        ),
        R::new(
            r"\b(502|503|504)\b|bad gateway|service unavailable|gateway timeout",
            Network,
            Medium,
            Tier1,
            &["retry_with_backoff", "wait_for_service_recovery"],
        ),
        R::new(
            r"(read|connect|socket|request) (timed out|timeout)",
            Network,
            Medium,
            Tier1,
            &["retry_with_backoff", "increase_timeout"],
        ),
        // Auth
        R::new(
            r"\b401\b|unauthorized",
            Auth,
            High,
            Tier3,
            &["verify_credentials"],
        ),
        R::new(
            r"\b403\b|forbidden|permission denied|access denied",
            Auth,
            High,
            Tier3,
            &["check_permissions"],
        ),
        R::new(
            r"invalid (api[ _-]?key|credentials|token)",
            Auth,
            High,
            Tier3,
            &["rotate_credentials"],
        ),
        R::new(
            r"authentication (failed|required|error)",
            Auth,
            High,
            Tier3,
            &["verify_credentials"],
        ),
        R::new(
            r"(token|session|credentials?) (has )?expired|expired (token|session)",
            Auth,
            Medium,
            Tier1,
            &["refresh_token"],
        ),
        // Resource
        R::new(
            r"out of memory|cannot allocate memory|\boom\b",
            Resource,
            High,
            Tier2,
            &["free_memory", "reduce_batch_size"],
        ),
        R::new(
            r"no space left on device|disk (is )?full|disk quota exceeded",
            Resource,
            High,
            Tier2,
            &["cleanup_disk_space"],
        ),
        R::new(
            r"too many open files|file descriptor limit",
            Resource,
            High,
            Tier2,
            &["close_file_handles"],
        ),
        R::new(
            r"resource temporarily unavailable|resource exhausted",
            Resource,
            Medium,
            Tier1,
            &["wait_and_retry"],
        ),
        // Dependency
        R::new(
            r"no module named|module ?not ?found",
            Dependency,
            Medium,
            Tier1,
            &["install_missing_dependency"],
        ),
        R::new(
            r"cannot find (module|package)|package .*not (found|installed)",
            Dependency,
            Medium,
            Tier1,
            &["install_missing_dependency"],
        ),
        R::new(
            r"version conflict|incompatible version|requires .* but .* is installed",
            Dependency,
            Medium,
            Tier2,
            &["pin_dependency_version"],
        ),
        R::new(
            r"cannot import name|importerror",
            Dependency,
            Medium,
            Tier1,
            &["check_import_path"],
        ),
        R::new(
            r"command not found|executable .*not found",
            Dependency,
            Medium,
            Tier1,
            &["install_missing_tool"],
        ),
        // LLM
        R::new(
            r"(context|token) (overflow|too long|length exceeded)|context_length_exceeded|maximum context length",
            Llm,
            Medium,
            Tier1,
            &["truncate_context", "summarize_history"],
        ),
        R::new(
            r"rate ?limit|too many requests|\b429\b",
            Llm,
            Medium,
            Tier1,
            &["retry_with_backoff", "reduce_request_rate"],
        ),
        R::new(
            r"model (is )?overloaded|overloaded_error|model not available",
            Llm,
            Medium,
            Tier1,
            &["retry_with_backoff", "switch_model"],
        ),
        R::new(
            r"failed to parse (model|llm) (output|response)|invalid (json|response) from (model|llm)",
            Llm,
            Medium,
            Tier2,
            &["retry_with_stricter_prompt"],
        ),
        R::new(
            r"content (filter|policy) (violation|triggered)|safety system",
            Llm,
            High,
            Tier3,
            &["review_prompt_content"],
        ),
        // MCP
        R::new(
            r"mcp (server|client|tool|session)",
            Mcp,
            Medium,
            Tier2,
            &["restart_mcp_server"],
        ),
        R::new(
            r"tool (call|invocation|execution) failed|unknown tool|tool .*not found",
            Mcp,
            Medium,
            Tier2,
            &["verify_tool_registration"],
        ),
        R::new(
            r"json-?rpc (error|failure)|jsonrpc",
            Mcp,
            Medium,
            Tier2,
            &["check_mcp_protocol"],
        ),
        R::new(
            r"(stdio|sse|transport) (closed|disconnected|error)",
            Mcp,
            Medium,
            Tier1,
            &["reconnect_transport"],
        ),
        // Container
        R::new(
            r"container (exited|crashed|failed|not running|died)",
            Container,
            High,
            Tier2,
            &["restart_container"],
        ),
        R::new(
            r"docker daemon|cannot connect to the docker|oci runtime",
            Container,
            High,
            Tier2,
            &["check_container_runtime"],
        ),
        R::new(
            r"image (not found|pull failed)|errimagepull|imagepullbackoff",
            Container,
            High,
            Tier2,
            &["verify_image_reference"],
        ),
        R::new(
            r"oomkilled|exit code 137",
            Container,
            High,
            Tier2,
            &["raise_memory_limit"],
        ),
        R::new(
            r"crashloopbackoff|pod .*(evicted|pending)",
            Container,
            High,
            Tier2,
            &["inspect_pod_events"],
        ),
        // VCS
        R::new(
            r"merge conflict|conflict \(content\)|automatic merge failed",
            Vcs,
            Medium,
            Tier3,
            &["resolve_merge_conflict"],
        ),
        R::new(
            r"not a git repository",
            Vcs,
            Medium,
            Tier2,
            &["initialize_repository"],
        ),
        R::new(
            r"(push|pull|updates?) (were |was )?rejected|non-fast-forward|failed to push",
            Vcs,
            Medium,
            Tier1,
            &["pull_and_rebase"],
        ),
        R::new(
            r"detached head|pathspec .*did not match|(branch|ref) .*(not found|does not exist)",
            Vcs,
            Medium,
            Tier2,
            &["verify_branch"],
        ),
        R::new(
            r"git (fetch|clone|checkout) failed|unable to access '",
            Vcs,
            Medium,
            Tier1,
            &["check_remote_access"],
        ),
        // Config
        R::new(
            r"(missing|invalid) (config|configuration|setting|environment variable)",
            Config,
            Medium,
            Tier2,
            &["check_configuration"],
        ),
        R::new(
            r"environment variable .*not set|env var .*(missing|not set)",
            Config,
            Medium,
            Tier2,
            &["set_environment_variable"],
        ),
        R::new(
            r"(yaml|toml|json) (parse|syntax|decode) error|invalid (yaml|toml|json)",
            Config,
            Medium,
            Tier2,
            &["validate_config_syntax"],
        ),
        R::new(
            r"missing required (field|key|parameter|argument)",
            Config,
            Medium,
            Tier2,
            &["check_required_fields"],
        ),
        // Workflow
        R::new(
            r"deadlock",
            Workflow,
            High,
            Tier2,
            &["break_dependency_cycle", "reset_workflow_state"],
        ),
        R::new(
            r"cycle detect(ed)?|circular dependency|dependency cycle",
            Workflow,
            High,
            Tier2,
            &["break_dependency_cycle"],
        ),
        R::new(
            r"invalid (state )?transition|illegal state",
            Workflow,
            High,
            Tier2,
            &["reset_workflow_state"],
        ),
        R::new(
            r"checkpoint (corrupt(ed)?|not found|mismatch)|failed to (load|restore) checkpoint",
            Workflow,
            High,
            Tier2,
            &["restore_previous_checkpoint"],
        ),
        R::new(
            r"recursion limit|max(imum)? (iterations|recursion depth) (reached|exceeded)",
            Workflow,
            High,
            Tier3,
            &["review_workflow_graph"],
        ),
        // Database
        R::new(
            r"(database|db) (is )?locked|could not obtain lock|lock wait timeout",
            Database,
            High,
            Tier1,
            &["wait_for_lock_release"],
        ),
        R::new(
            r"unique constraint|integrity ?error|duplicate key|foreign key constraint",
            Database,
            High,
            Tier2,
            &["check_data_integrity"],
        ),
        R::new(
            r"connection pool (exhausted|timeout|timed out)|too many connections|remaining connection slots",
            Database,
            High,
            Tier1,
            &["reduce_connection_usage"],
        ),
        R::new(
            r"syntax error at or near|relation .* does not exist|no such (table|column)",
            Database,
            High,
            Tier2,
            &["run_migrations"],
        ),
        R::new(
            r"serialization failure|could not serialize|transaction (aborted|rolled back)",
            Database,
            High,
            Tier1,
            &["retry_transaction"],
        ),
        // External
        R::new(
            r"(github|gitlab|linear|slack|jira|notion) api",
            External,
            Medium,
            Tier2,
            &["check_service_status"],
        ),
        R::new(
            r"upstream (service|provider|server) (error|failure|unavailable)",
            External,
            Medium,
            Tier2,
            &["check_service_status"],
        ),
        R::new(
            r"webhook (failed|rejected|delivery failed)",
            External,
            Medium,
            Tier2,
            &["verify_webhook_endpoint"],
        ),
        R::new(
            r"third[- ]party (service|api)|internal server error",
            External,
            Medium,
            Tier2,
            &["check_service_status", "retry_with_backoff"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(category: ErrorCategory, severity: ErrorSeverity) -> ClassificationRule {
        ClassificationRule::new("x", category, severity, RecoveryTier::Tier2, &[])
    }

    #[test]
    fn test_every_category_has_rules() {
        let rules = default_rules();
        for category in ErrorCategory::ALL {
            let count = rules.iter().filter(|r| r.category() == category).count();
            assert!(
                (3..=5).contains(&count),
                "{} has {} rules",
                category,
                count
            );
        }
    }

    #[test]
    fn test_precedence_covers_all_categories() {
        for category in ErrorCategory::ALL {
            assert!(CATEGORY_PRECEDENCE.contains(&category));
        }
    }

    #[test]
    fn test_outranks_prefers_severity() {
        let high = rule(ErrorCategory::External, ErrorSeverity::High);
        let medium = rule(ErrorCategory::Auth, ErrorSeverity::Medium);
        assert!(high.outranks(&medium));
        assert!(!medium.outranks(&high));
    }

    #[test]
    fn test_outranks_breaks_ties_by_precedence() {
        let llm = rule(ErrorCategory::Llm, ErrorSeverity::Medium);
        let network = rule(ErrorCategory::Network, ErrorSeverity::Medium);
        assert!(llm.outranks(&network));
        assert!(!network.outranks(&llm));
        assert!(!llm.outranks(&llm.clone()));
    }

    #[test]
    fn test_baseline_prefers_kind_then_status_then_subsystem() {
        let by_kind = Fault::new(ErrorKind::Timeout, "x")
            .with_http_status(401)
            .with_subsystem("mcp");
        assert_eq!(kind_baseline(&by_kind).map(|b| b.category), Some(ErrorCategory::Network));

        let by_status = Fault::unknown("HttpError", "x")
            .with_http_status(403)
            .with_subsystem("mcp");
        assert_eq!(kind_baseline(&by_status).map(|b| b.category), Some(ErrorCategory::Auth));

        let by_subsystem = Fault::unknown("ToolError", "x").with_subsystem("mcp");
        assert_eq!(kind_baseline(&by_subsystem).map(|b| b.category), Some(ErrorCategory::Mcp));

        assert!(kind_baseline(&Fault::unknown("ToolError", "x")).is_none());
    }
}
