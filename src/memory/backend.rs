use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{DistanceMetric, ErrorPattern, MemoryError};
use crate::classify::ErrorCategory;

/// Payload filter applied to scroll and search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternFilter {
    pub category: Option<ErrorCategory>,
    pub signature_key: Option<String>,
    /// Only patterns seen at or after this instant
    pub min_last_seen: Option<DateTime<Utc>>,
}

impl PatternFilter {
    pub fn by_signature(signature_key: impl Into<String>) -> Self {
        Self {
            signature_key: Some(signature_key.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, pattern: &ErrorPattern) -> bool {
        self.category.map_or(true, |c| pattern.category == c)
            && self
                .signature_key
                .as_deref()
                .map_or(true, |k| pattern.signature_key == k)
            && self.min_last_seen.map_or(true, |t| pattern.last_seen >= t)
    }
}

/// A search hit. `score` is in `[0, 1]`, higher is closer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPattern {
    pub pattern: ErrorPattern,
    pub score: f32,
}

/// Storage for patterns and their embeddings.
///
/// Patterns are keyed by `id` inside a named collection.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Creates the collection if it does not exist yet.
    async fn ensure_collection(
        &self,
        collection: &str,
        vector_size: usize,
        metric: DistanceMetric,
    ) -> Result<(), MemoryError>;

    /// Inserts or replaces a pattern.
    async fn upsert(&self, collection: &str, pattern: ErrorPattern) -> Result<(), MemoryError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<ErrorPattern>, MemoryError>;

    /// Nearest patterns matching `filter`, best first, at most `limit`,
    /// none below `min_score`.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PatternFilter,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredPattern>, MemoryError>;

    /// Patterns matching `filter`, in no particular order.
    async fn scroll(
        &self,
        collection: &str,
        filter: &PatternFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ErrorPattern>, MemoryError>;

    /// Deletes patterns by id, returning how many existed.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, MemoryError>;
}

#[derive(Debug)]
struct Collection {
    vector_size: usize,
    metric: DistanceMetric,
    points: HashMap<String, ErrorPattern>,
}

/// Process-local vector backend using brute-force search.
#[derive(Debug, Default)]
pub struct InMemoryVectorBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of patterns in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.points.len())
    }

    fn missing(collection: &str) -> MemoryError {
        MemoryError::Backend(format!("collection '{collection}' does not exist"))
    }
}

/// Similarity mapped into `[0, 1]`.
fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        DistanceMetric::Cosine => {
            let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                0.0
            } else {
                (dot / (na * nb)).clamp(0.0, 1.0)
            }
        }
        DistanceMetric::Dot => dot.clamp(0.0, 1.0),
        DistanceMetric::Euclid => {
            let distance = a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + distance)
        }
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorBackend {
    async fn ensure_collection(
        &self,
        collection: &str,
        vector_size: usize,
        metric: DistanceMetric,
    ) -> Result<(), MemoryError> {
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(collection) {
            if existing.vector_size != vector_size {
                return Err(MemoryError::DimensionMismatch {
                    expected: existing.vector_size,
                    actual: vector_size,
                });
            }
            return Ok(());
        }
        collections.insert(
            collection.to_string(),
            Collection {
                vector_size,
                metric,
                points: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn upsert(&self, collection: &str, pattern: ErrorPattern) -> Result<(), MemoryError> {
        let mut collections = self.collections.write();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;
        if pattern.embedding.len() != target.vector_size {
            return Err(MemoryError::DimensionMismatch {
                expected: target.vector_size,
                actual: pattern.embedding.len(),
            });
        }
        target.points.insert(pattern.id.clone(), pattern);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<ErrorPattern>, MemoryError> {
        let collections = self.collections.read();
        let target = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        Ok(target.points.get(id).cloned())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PatternFilter,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredPattern>, MemoryError> {
        let collections = self.collections.read();
        let target = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        if vector.len() != target.vector_size {
            return Err(MemoryError::DimensionMismatch {
                expected: target.vector_size,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<ScoredPattern> = target
            .points
            .values()
            .filter(|p| filter.matches(p))
            .map(|p| ScoredPattern {
                score: similarity(target.metric, vector, &p.embedding),
                pattern: p.clone(),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &PatternFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ErrorPattern>, MemoryError> {
        let collections = self.collections.read();
        let target = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        let matching = target.points.values().filter(|p| filter.matches(p)).cloned();
        Ok(match limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, MemoryError> {
        let mut collections = self.collections.write();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;
        Ok(ids.iter().filter(|id| target.points.remove(*id).is_some()).count())
    }
}
