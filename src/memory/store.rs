use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use super::{
    EmbeddingProvider, ErrorPattern, HashingEmbedder, HttpEmbeddingProvider,
    InMemoryVectorBackend, MemoryError, PatternFilter, PatternMatch, PatternMemoryConfig,
    ResolutionStep, VectorBackend,
};
use crate::classify::{
    normalize_message, ContextMap, ErrorClassification, ErrorClassifier, ErrorSignature,
};
use crate::fault::Fault;

/// Patterns with at least this many attempts are dropped from similarity
/// results unless effective.
const PROVEN_ATTEMPTS: u32 = 3;

/// Patterns with at least this many attempts are pruned when below the
/// minimum success rate.
const PRUNE_ATTEMPTS: u32 = 5;

/// Learned fault → resolution associations.
///
/// Every public operation degrades to a no-op (empty result or `None`)
/// when memory is disabled, a collaborator is missing, or a collaborator
/// call fails. Failures are logged at `warn`.
pub struct ErrorPatternStore {
    config: PatternMemoryConfig,
    classifier: ErrorClassifier,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    backend: Option<Arc<dyn VectorBackend>>,
    cache: Cache<String, ErrorPattern>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    collection_ready: OnceCell<()>,
}

impl ErrorPatternStore {
    pub fn new(
        config: PatternMemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        backend: Option<Arc<dyn VectorBackend>>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache.max_entries)
            .time_to_live(config.cache.ttl())
            .build();
        Self {
            config,
            classifier: ErrorClassifier::new(),
            embedder,
            backend,
            cache,
            locks: DashMap::new(),
            collection_ready: OnceCell::new(),
        }
    }

    /// Local hashing embedder over an in-process backend.
    pub fn in_memory(config: PatternMemoryConfig) -> Self {
        let embedder = HashingEmbedder::new(config.vector_backend.vector_size);
        Self::new(
            config,
            Some(Arc::new(embedder)),
            Some(Arc::new(InMemoryVectorBackend::new())),
        )
    }

    /// A store with no collaborators; every operation is a no-op.
    pub fn disabled() -> Self {
        let config = PatternMemoryConfig {
            enabled: false,
            ..Default::default()
        };
        Self::new(config, None, None)
    }

    /// Chooses the embedder from config: the HTTP provider when an endpoint
    /// is set, the hashing embedder otherwise. Patterns live in process.
    pub fn from_config(config: PatternMemoryConfig) -> Result<Self, MemoryError> {
        if !config.enabled {
            return Ok(Self::new(config, None, None));
        }
        let size = config.vector_backend.vector_size;
        let embedder: Arc<dyn EmbeddingProvider> =
            match HttpEmbeddingProvider::from_config(&config.embedding, size)? {
                Some(http) => Arc::new(http),
                None => Arc::new(HashingEmbedder::new(size)),
            };
        Ok(Self::new(
            config,
            Some(embedder),
            Some(Arc::new(InMemoryVectorBackend::new())),
        ))
    }

    pub fn config(&self) -> &PatternMemoryConfig {
        &self.config
    }

    /// Whether memory is enabled and both collaborators are present.
    pub fn is_available(&self) -> bool {
        self.collaborators().is_some()
    }

    fn collaborators(&self) -> Option<(&Arc<dyn EmbeddingProvider>, &Arc<dyn VectorBackend>)> {
        if !self.config.enabled {
            return None;
        }
        match (&self.embedder, &self.backend) {
            (Some(e), Some(b)) => Some((e, b)),
            _ => None,
        }
    }

    fn collection(&self) -> &str {
        &self.config.vector_backend.collection_name
    }

    async fn ensure_collection(&self, backend: &Arc<dyn VectorBackend>) -> Result<(), MemoryError> {
        self.collection_ready
            .get_or_try_init(|| async {
                backend
                    .ensure_collection(
                        self.collection(),
                        self.config.vector_backend.vector_size,
                        self.config.vector_backend.distance_metric,
                    )
                    .await
            })
            .await
            .map(|_| ())
    }

    fn lock_for(&self, signature_key: &str) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(signature_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    fn classification_for(
        &self,
        fault: &Fault,
        classification: Option<&ErrorClassification>,
        context: Option<&ContextMap>,
    ) -> ErrorClassification {
        match classification {
            Some(c) => c.clone(),
            None => self.classifier.classify(fault, context),
        }
    }

    /// Pattern with exactly this signature, from the cache or the backend.
    async fn find_exact(
        &self,
        backend: &Arc<dyn VectorBackend>,
        signature_key: &str,
    ) -> Result<Option<ErrorPattern>, MemoryError> {
        if let Some(cached) = self.cache.get(signature_key).await {
            return Ok(Some(cached));
        }
        let found = backend
            .scroll(
                self.collection(),
                &PatternFilter::by_signature(signature_key),
                Some(1),
            )
            .await?
            .into_iter()
            .next();
        if let Some(pattern) = &found {
            self.cache
                .insert(signature_key.to_string(), pattern.clone())
                .await;
        }
        Ok(found)
    }

    /// Records that `resolution_steps` were tried for `fault`.
    ///
    /// Merges into the pattern with the same signature if one exists,
    /// otherwise creates a new one. Returns the pattern id.
    pub async fn store_pattern(
        &self,
        fault: &Fault,
        resolution_steps: &[ResolutionStep],
        success: bool,
        classification: Option<&ErrorClassification>,
        context: Option<&ContextMap>,
    ) -> Option<String> {
        let (embedder, backend) = self.collaborators()?;
        let classification = self.classification_for(fault, classification, context);

        match self
            .try_store(embedder, backend, fault, resolution_steps, success, &classification, context)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to store error pattern");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_store(
        &self,
        embedder: &Arc<dyn EmbeddingProvider>,
        backend: &Arc<dyn VectorBackend>,
        fault: &Fault,
        resolution_steps: &[ResolutionStep],
        success: bool,
        classification: &ErrorClassification,
        context: Option<&ContextMap>,
    ) -> Result<String, MemoryError> {
        self.ensure_collection(backend).await?;

        let signature = ErrorSignature::from_fault(fault, classification);
        let key = signature.to_key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let cap = self.config.storage.max_patterns_per_error;
        let pattern = match self.find_exact(backend, &key).await? {
            Some(mut existing) => {
                existing.record_attempt(success);
                existing.merge_steps(resolution_steps, cap);
                if let Some(context) = context {
                    existing
                        .context_hints
                        .extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                debug!(pattern = %existing.id, attempts = existing.attempt_count, "merged error pattern");
                existing
            }
            None => {
                let embedding = embedder.embed(fault.message()).await?;
                let now = Utc::now();
                let mut created = ErrorPattern {
                    id: uuid::Uuid::new_v4().to_string(),
                    signature_key: key.clone(),
                    category: signature.category,
                    error_kind: signature.error_kind.clone(),
                    message_template: normalize_message(fault.message()),
                    resolution_steps: Vec::new(),
                    success_count: u32::from(success),
                    attempt_count: 1,
                    last_seen: now,
                    created_at: now,
                    context_hints: context.cloned().unwrap_or_default(),
                    embedding,
                };
                created.merge_steps(resolution_steps, cap);
                debug!(pattern = %created.id, signature = %key, "created error pattern");
                created
            }
        };

        let id = pattern.id.clone();
        backend.upsert(self.collection(), pattern.clone()).await?;
        self.cache.insert(key, pattern).await;
        Ok(id)
    }

    /// Past patterns similar to `fault`, best first.
    ///
    /// An effective pattern with the exact signature is returned alone. Otherwise
    /// the result is the category-scoped similarity search, minus proven
    /// failures, plus the exact pattern if there is one.
    pub async fn find_similar_patterns(
        &self,
        fault: &Fault,
        classification: Option<&ErrorClassification>,
        context: Option<&ContextMap>,
    ) -> Vec<PatternMatch> {
        let Some((embedder, backend)) = self.collaborators() else {
            return Vec::new();
        };
        let classification = self.classification_for(fault, classification, context);

        match self
            .try_find_similar(embedder, backend, fault, &classification)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "pattern retrieval failed");
                Vec::new()
            }
        }
    }

    async fn try_find_similar(
        &self,
        embedder: &Arc<dyn EmbeddingProvider>,
        backend: &Arc<dyn VectorBackend>,
        fault: &Fault,
        classification: &ErrorClassification,
    ) -> Result<Vec<PatternMatch>, MemoryError> {
        self.ensure_collection(backend).await?;

        let min_rate = self.config.storage.min_success_rate;
        let key = ErrorSignature::from_fault(fault, classification).to_key();
        let exact = self.find_exact(backend, &key).await?;

        if let Some(pattern) = &exact {
            if pattern.is_effective(min_rate) {
                return Ok(vec![PatternMatch {
                    pattern: pattern.clone(),
                    similarity_score: 1.0,
                    is_exact_match: true,
                }]);
            }
        }

        let retrieval = &self.config.retrieval;
        let vector = embedder.embed(fault.message()).await?;
        let filter = PatternFilter {
            category: Some(classification.category),
            signature_key: None,
            min_last_seen: Some(Utc::now() - chrono::Duration::days(i64::from(retrieval.max_age_days))),
        };
        let hits = backend
            .search(
                self.collection(),
                &vector,
                &filter,
                retrieval.top_k,
                retrieval.min_similarity_score,
            )
            .await?;

        let exact_id = exact.as_ref().map(|p| p.id.clone());
        let mut matches: Vec<PatternMatch> = hits
            .into_iter()
            .filter(|hit| {
                hit.pattern.attempt_count < PROVEN_ATTEMPTS || hit.pattern.is_effective(min_rate)
            })
            .map(|hit| {
                let is_exact = exact_id.as_deref() == Some(hit.pattern.id.as_str());
                PatternMatch {
                    similarity_score: if is_exact { 1.0 } else { hit.score.clamp(0.0, 1.0) },
                    is_exact_match: is_exact,
                    pattern: hit.pattern,
                }
            })
            .collect();

        if let Some(pattern) = exact {
            if !matches.iter().any(|m| m.is_exact_match) {
                matches.push(PatternMatch {
                    pattern,
                    similarity_score: 1.0,
                    is_exact_match: true,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.similarity_score
                .total_cmp(&a.similarity_score)
                .then(b.is_exact_match.cmp(&a.is_exact_match))
        });
        Ok(matches)
    }

    /// Records the outcome of applying a stored pattern. Returns whether the
    /// pattern was found and updated.
    pub async fn record_resolution_outcome(&self, pattern_id: &str, success: bool) -> bool {
        let Some((_, backend)) = self.collaborators() else {
            return false;
        };
        match self.try_record_outcome(backend, pattern_id, success).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, pattern = pattern_id, "failed to record resolution outcome");
                false
            }
        }
    }

    async fn try_record_outcome(
        &self,
        backend: &Arc<dyn VectorBackend>,
        pattern_id: &str,
        success: bool,
    ) -> Result<bool, MemoryError> {
        self.ensure_collection(backend).await?;

        let Some(snapshot) = backend.get(self.collection(), pattern_id).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&snapshot.signature_key);
        let _guard = lock.lock().await;

        // re-read under the lock
        let Some(mut pattern) = backend.get(self.collection(), pattern_id).await? else {
            return Ok(false);
        };
        pattern.record_attempt(success);
        let key = pattern.signature_key.clone();
        backend.upsert(self.collection(), pattern.clone()).await?;
        self.cache.insert(key, pattern).await;
        Ok(true)
    }

    /// Deletes patterns past retention or proven ineffective. Returns the
    /// number deleted.
    pub async fn cleanup_stale_patterns(&self) -> usize {
        let Some((_, backend)) = self.collaborators() else {
            return 0;
        };
        match self.try_cleanup(backend).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "pattern cleanup failed");
                0
            }
        }
    }

    async fn try_cleanup(&self, backend: &Arc<dyn VectorBackend>) -> Result<usize, MemoryError> {
        self.ensure_collection(backend).await?;

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.storage.retention_days));
        let min_rate = self.config.storage.min_success_rate;
        let stale: Vec<ErrorPattern> = backend
            .scroll(self.collection(), &PatternFilter::default(), None)
            .await?
            .into_iter()
            .filter(|p| {
                p.last_seen < cutoff
                    || (p.attempt_count >= PRUNE_ATTEMPTS && p.success_rate() < min_rate)
            })
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = stale.iter().map(|p| p.id.clone()).collect();
        let removed = backend.delete(self.collection(), &ids).await?;
        for pattern in &stale {
            self.cache.invalidate(&pattern.signature_key).await;
        }
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        debug!(removed, "cleaned up stale error patterns");
        Ok(removed)
    }

    /// Pattern for a signature key from the local cache only.
    pub async fn cached_pattern(&self, signature_key: &str) -> Option<ErrorPattern> {
        if !self.is_available() {
            return None;
        }
        self.cache.get(signature_key).await
    }

    /// Loads a pattern by id from the backend.
    pub async fn get_pattern(&self, pattern_id: &str) -> Option<ErrorPattern> {
        let (_, backend) = self.collaborators()?;
        if let Err(e) = self.ensure_collection(backend).await {
            warn!(error = %e, "vector backend unavailable");
            return None;
        }
        match backend.get(self.collection(), pattern_id).await {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(error = %e, pattern = pattern_id, "failed to load error pattern");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::RecoveryTier;
    use crate::fault::ErrorKind;

    fn store() -> ErrorPatternStore {
        ErrorPatternStore::in_memory(PatternMemoryConfig::default())
    }

    fn steps() -> Vec<ResolutionStep> {
        vec![ResolutionStep::new("retry_with_backoff", RecoveryTier::Tier1)]
    }

    #[tokio::test]
    async fn test_store_creates_then_merges() {
        let store = store();
        let fault = Fault::new(ErrorKind::Timeout, "read timed out after 30000 ms");

        let first = store.store_pattern(&fault, &steps(), true, None, None).await.unwrap();
        let again = Fault::new(ErrorKind::Timeout, "read timed out after 45000 ms");
        let extra = vec![
            ResolutionStep::new("retry_with_backoff", RecoveryTier::Tier1),
            ResolutionStep::new("increase_timeout", RecoveryTier::Tier1),
        ];
        let second = store.store_pattern(&again, &extra, false, None, None).await.unwrap();
        assert_eq!(first, second);

        let pattern = store.get_pattern(&first).await.unwrap();
        assert_eq!(pattern.attempt_count, 2);
        assert_eq!(pattern.success_count, 1);
        assert_eq!(pattern.resolution_steps.len(), 2);
        assert_eq!(pattern.message_template, "read timed out after <n> ms");
    }

    #[tokio::test]
    async fn test_disabled_store_is_noop() {
        let store = ErrorPatternStore::disabled();
        let fault = Fault::new(ErrorKind::Timeout, "read timed out");
        assert!(!store.is_available());
        assert!(store.store_pattern(&fault, &steps(), true, None, None).await.is_none());
        assert!(store.find_similar_patterns(&fault, None, None).await.is_empty());
        assert!(!store.record_resolution_outcome("x", true).await);
        assert_eq!(store.cleanup_stale_patterns().await, 0);
    }

    #[tokio::test]
    async fn test_missing_backend_is_noop() {
        let store = ErrorPatternStore::new(
            PatternMemoryConfig::default(),
            Some(Arc::new(HashingEmbedder::new(8))),
            None,
        );
        let fault = Fault::new(ErrorKind::Timeout, "read timed out");
        assert!(store.store_pattern(&fault, &steps(), true, None, None).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_serves_stored_pattern() {
        let store = store();
        let fault = Fault::new(ErrorKind::ConnectionError, "Connection refused");
        let classification = ErrorClassifier::new().classify(&fault, None);
        let key = ErrorSignature::from_fault(&fault, &classification).to_key();

        store
            .store_pattern(&fault, &steps(), true, Some(&classification), None)
            .await
            .unwrap();
        let cached = store.cached_pattern(&key).await.unwrap();
        assert!(cached.has_simple_retry());
    }

    #[tokio::test]
    async fn test_record_outcome_unknown_id() {
        let store = store();
        assert!(!store.record_resolution_outcome("does-not-exist", true).await);
    }

    #[tokio::test]
    async fn test_cleanup_prunes_ineffective() {
        let store = store();
        let fault = Fault::new(ErrorKind::RuntimeError, "database is locked");
        let id = store.store_pattern(&fault, &steps(), false, None, None).await.unwrap();
        for _ in 0..4 {
            store.record_resolution_outcome(&id, false).await;
        }
        assert_eq!(store.cleanup_stale_patterns().await, 1);
        assert!(store.get_pattern(&id).await.is_none());
    }
}
