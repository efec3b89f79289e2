//! Error pattern memory.
//!
//! Remembers which resolution steps worked for which fault signatures, and
//! retrieves similar past faults by embedding similarity. The store talks to
//! two collaborators, an [`EmbeddingProvider`] and a [`VectorBackend`]; when
//! either is missing every operation quietly becomes a no-op.

mod backend;
mod embedding;
mod store;

pub use backend::{InMemoryVectorBackend, PatternFilter, ScoredPattern, VectorBackend};
pub use embedding::{EmbeddingProvider, HashingEmbedder, HttpEmbeddingProvider};
pub use store::ErrorPatternStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::classify::{ContextMap, ErrorCategory, RecoveryTier};
use crate::config::ConfigError;

/// Actions that amount to running the operation again unchanged.
pub const SIMPLE_RETRY_ACTIONS: [&str; 4] =
    ["retry", "simple_retry", "retry_with_backoff", "immediate_retry"];

/// Failures of the embedding provider or vector backend.
///
/// The store absorbs these; they surface only from the collaborators.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector backend error: {0}")]
    Backend(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One step of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStep {
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub description: String,
    pub tier: RecoveryTier,
}

impl ResolutionStep {
    pub fn new(action: impl Into<String>, tier: RecoveryTier) -> Self {
        Self {
            action: action.into(),
            parameters: HashMap::new(),
            description: String::new(),
            tier,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Whether this step just reruns the operation.
    pub fn is_simple_retry(&self) -> bool {
        SIMPLE_RETRY_ACTIONS.contains(&self.action.as_str())
    }
}

/// A remembered association between a fault signature and its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub signature_key: String,
    pub category: ErrorCategory,
    pub error_kind: String,
    /// Normalized message
    pub message_template: String,
    pub resolution_steps: Vec<ResolutionStep>,
    pub success_count: u32,
    pub attempt_count: u32,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context_hints: ContextMap,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl ErrorPattern {
    /// `success_count / attempt_count`, 0.0 before any attempt.
    pub fn success_rate(&self) -> f64 {
        if self.attempt_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.attempt_count as f64
        }
    }

    /// At least two attempts and a success rate of at least `min_success_rate`.
    pub fn is_effective(&self, min_success_rate: f64) -> bool {
        self.attempt_count >= 2 && self.success_rate() >= min_success_rate
    }

    /// Whether any step just reruns the operation.
    pub fn has_simple_retry(&self) -> bool {
        self.resolution_steps.iter().any(ResolutionStep::is_simple_retry)
    }

    pub(crate) fn record_attempt(&mut self, success: bool) {
        self.attempt_count += 1;
        if success {
            self.success_count += 1;
        }
        self.last_seen = Utc::now();
    }

    /// Appends steps whose action is not yet known, up to `cap` steps.
    pub(crate) fn merge_steps(&mut self, steps: &[ResolutionStep], cap: usize) {
        for step in steps {
            if self.resolution_steps.len() >= cap {
                break;
            }
            if !self.resolution_steps.iter().any(|s| s.action == step.action) {
                self.resolution_steps.push(step.clone());
            }
        }
    }
}

/// A retrieved pattern with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: ErrorPattern,
    /// Similarity in `[0, 1]`
    pub similarity_score: f32,
    pub is_exact_match: bool,
}

/// Similarity function of the vector backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::Dot => write!(f, "dot"),
            DistanceMetric::Euclid => write!(f, "euclid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    /// OpenAI-compatible `/embeddings` URL. The local hashing embedder is
    /// used when unset.
    pub endpoint: Option<String>,
    /// Environment variable holding the API key for `endpoint`
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            endpoint: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorBackendConfig {
    pub collection_name: String,
    pub vector_size: usize,
    pub distance_metric: DistanceMetric,
}

impl Default for VectorBackendConfig {
    fn default() -> Self {
        Self {
            collection_name: "error_patterns".to_string(),
            vector_size: 384,
            distance_metric: DistanceMetric::Cosine,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub min_similarity_score: f32,
    pub top_k: usize,
    pub max_age_days: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            min_similarity_score: 0.75,
            top_k: 5,
            max_age_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub min_success_rate: f64,
    pub retention_days: u32,
    pub max_patterns_per_error: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.6,
            retention_days: 180,
            max_patterns_per_error: 5,
        }
    }
}

/// Local TTL cache in front of the vector backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Configuration of the error pattern memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternMemoryConfig {
    pub enabled: bool,
    pub embedding: EmbeddingConfig,
    pub vector_backend: VectorBackendConfig,
    pub retrieval: RetrievalConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
}

impl Default for PatternMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            embedding: EmbeddingConfig::default(),
            vector_backend: VectorBackendConfig::default(),
            retrieval: RetrievalConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl PatternMemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(format!("error_pattern_memory.{msg}")));

        if self.vector_backend.vector_size == 0 {
            return invalid("vector_backend.vector_size must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_similarity_score) {
            return invalid("retrieval.min_similarity_score must be between 0 and 1");
        }
        if self.retrieval.top_k == 0 {
            return invalid("retrieval.top_k must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.storage.min_success_rate) {
            return invalid("storage.min_success_rate must be between 0 and 1");
        }
        if self.storage.max_patterns_per_error == 0 {
            return invalid("storage.max_patterns_per_error must be greater than 0");
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be greater than 0");
        }
        Ok(())
    }
}
