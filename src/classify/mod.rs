//! Error classification for the recovery engine.
//!
//! This module maps a [`Fault`] to an [`ErrorCategory`], an [`ErrorSeverity`]
//! and a suggested [`RecoveryTier`]. Classification is a pure function of the
//! fault and the optional context map: it performs no I/O and no randomness,
//! so it is safe to call repeatedly.

pub mod rules;
pub mod signature;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::fault::Fault;

pub use rules::{ClassificationRule, KindBaseline, CATEGORY_PRECEDENCE};
pub use signature::{normalize_message, ErrorSignature};

/// Maximum number of matched rule patterns kept on a classification.
pub const MAX_MATCHED_PATTERNS: usize = 3;

/// Maximum number of remediation hints kept on a classification.
pub const MAX_REMEDIATION_HINTS: usize = 5;

/// Free-form context attached to classifications and recovery requests.
pub type ContextMap = HashMap<String, serde_json::Value>;

/// The subsystem a fault belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Connectivity, DNS, gateway errors
    Network,
    /// Authentication and authorization failures
    Auth,
    /// Memory, disk, file handle exhaustion
    Resource,
    /// Missing or conflicting packages
    Dependency,
    /// Model provider errors (context overflow, rate limits)
    Llm,
    /// MCP server and tool-call failures
    Mcp,
    /// Container runtime failures
    Container,
    /// Version control failures
    Vcs,
    /// Configuration and input errors
    Config,
    /// Workflow engine errors (deadlocks, invalid transitions)
    Workflow,
    /// Database errors
    Database,
    /// Third-party service errors and anything unrecognized
    External,
}

impl ErrorCategory {
    /// All categories in declaration order.
    pub const ALL: [ErrorCategory; 12] = [
        ErrorCategory::Network,
        ErrorCategory::Auth,
        ErrorCategory::Resource,
        ErrorCategory::Dependency,
        ErrorCategory::Llm,
        ErrorCategory::Mcp,
        ErrorCategory::Container,
        ErrorCategory::Vcs,
        ErrorCategory::Config,
        ErrorCategory::Workflow,
        ErrorCategory::Database,
        ErrorCategory::External,
    ];

    /// Get a string representation of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Llm => "llm",
            ErrorCategory::Mcp => "mcp",
            ErrorCategory::Container => "container",
            ErrorCategory::Vcs => "vcs",
            ErrorCategory::Config => "config",
            ErrorCategory::Workflow => "workflow",
            ErrorCategory::Database => "database",
            ErrorCategory::External => "external",
        }
    }

    /// Whether recovering from this category needs a workflow state reset.
    pub fn requires_state_reset(&self) -> bool {
        matches!(self, ErrorCategory::Workflow | ErrorCategory::Database)
    }

    /// Whether recovering from this category needs resource cleanup.
    pub fn requires_resource_cleanup(&self) -> bool {
        matches!(self, ErrorCategory::Resource | ErrorCategory::Container)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .iter()
            .copied()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown error category: {s}"))
    }
}

/// How bad a fault is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rung of the recovery ladder, ordered by cost and latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecoveryTier {
    /// Instant heuristic triage, no remote calls
    Tier0,
    /// Automatic remediation and retry with backoff
    Tier1,
    /// Retrieval of learned resolutions
    Tier2,
    /// Agent-assisted diagnosis
    Tier3,
    /// Human escalation
    Tier4,
}

impl RecoveryTier {
    /// All tiers in escalation order.
    pub const ALL: [RecoveryTier; 5] = [
        RecoveryTier::Tier0,
        RecoveryTier::Tier1,
        RecoveryTier::Tier2,
        RecoveryTier::Tier3,
        RecoveryTier::Tier4,
    ];

    /// Numeric level (0-4).
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Tier for a numeric level, `None` past Tier4.
    pub fn from_level(level: u8) -> Option<Self> {
        RecoveryTier::ALL.get(level as usize).copied()
    }

    /// The next tier up, `None` after Tier4.
    pub fn next(&self) -> Option<Self> {
        Self::from_level(self.level() + 1)
    }

    /// Whether faults suggested at this tier can be handled by retrying.
    pub fn is_retriable(&self) -> bool {
        self.level() <= 2
    }
}

impl fmt::Display for RecoveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.level())
    }
}

/// The result of classifying a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub suggested_tier: RecoveryTier,
    /// `CATEGORY_Kind`, e.g. `NETWORK_ConnectionError`
    pub error_code: String,
    pub is_retriable: bool,
    pub requires_state_reset: bool,
    pub requires_resource_cleanup: bool,
    /// Source patterns of the rules that matched, at most three.
    pub matched_patterns: Vec<String>,
    /// Deduplicated remediation hints, at most five.
    pub remediation_hints: Vec<String>,
    pub context: ContextMap,
}

/// Classifies faults using a kind baseline table and an ordered rule table.
#[derive(Debug)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Creates a classifier with the built-in rule table.
    pub fn new() -> Self {
        Self {
            rules: rules::default_rules(),
        }
    }

    /// Creates a classifier with custom rules.
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Adds a custom rule after the built-in ones.
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
    }

    /// Returns the configured rules.
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classifies a fault.
    ///
    /// The kind (and HTTP status / subsystem payload) gives a baseline. Every
    /// message rule that matches contributes its pattern and hints; the
    /// strongest match decides the category: highest severity first, then
    /// the earlier category in [`CATEGORY_PRECEDENCE`], then table order.
    /// With no match at all the fault is `external` at tier 2.
    pub fn classify(&self, fault: &Fault, context: Option<&ContextMap>) -> ErrorClassification {
        let message = fault.message().to_lowercase();

        let mut matched_patterns = Vec::new();
        let mut hints: Vec<String> = Vec::new();
        let mut winner: Option<&ClassificationRule> = None;

        for rule in &self.rules {
            if !rule.matches(&message) {
                continue;
            }
            matched_patterns.push(rule.pattern().to_string());
            hints.extend(rule.hints().iter().cloned());
            winner = match winner {
                Some(current) if !rule.outranks(current) => Some(current),
                _ => Some(rule),
            };
        }

        let baseline = rules::kind_baseline(fault);
        let (category, severity, tier) = match (winner, baseline) {
            (Some(rule), _) => (rule.category(), rule.severity(), rule.tier()),
            (None, Some(base)) => {
                hints.extend(base.hints.iter().map(|h| h.to_string()));
                (base.category, base.severity, base.tier)
            }
            (None, None) => (
                ErrorCategory::External,
                ErrorSeverity::Medium,
                RecoveryTier::Tier2,
            ),
        };

        let mut remediation_hints: Vec<String> = Vec::new();
        for hint in hints {
            if !remediation_hints.contains(&hint) {
                remediation_hints.push(hint);
            }
        }
        remediation_hints.truncate(MAX_REMEDIATION_HINTS);
        matched_patterns.truncate(MAX_MATCHED_PATTERNS);

        let classification = ErrorClassification {
            category,
            severity,
            suggested_tier: tier,
            error_code: format!(
                "{}_{}",
                category.as_str().to_uppercase(),
                fault.kind().as_str()
            ),
            is_retriable: tier.is_retriable(),
            requires_state_reset: category.requires_state_reset(),
            requires_resource_cleanup: category.requires_resource_cleanup(),
            matched_patterns,
            remediation_hints,
            context: context.cloned().unwrap_or_default(),
        };

        tracing::debug!(
            category = %classification.category,
            severity = %classification.severity,
            tier = %classification.suggested_tier,
            code = %classification.error_code,
            "classified fault"
        );

        classification
    }

    /// Builds the signature of a fault under an existing classification.
    pub fn signature(&self, fault: &Fault, classification: &ErrorClassification) -> ErrorSignature {
        ErrorSignature::from_fault(fault, classification)
    }
}
