use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{EmbeddingConfig, MemoryError};
use crate::classify::normalize_message;

/// Turns fault messages into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Length of the vectors this provider returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Local feature-hashing embedder.
///
/// Each word and word bigram of the normalized message is hashed to a signed
/// bucket; the result is L2-normalized. Deterministic and offline, which
/// makes it the default when no embedding endpoint is configured.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous form of [`EmbeddingProvider::embed`].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let normalized = normalize_message(text);
        let words: Vec<&str> = normalized
            .split(|c: char| !(c.is_alphanumeric() || c == '<' || c == '>' || c == '_'))
            .filter(|w| !w.is_empty())
            .collect();

        let mut vector = vec![0.0f32; self.dimension];
        for word in &words {
            self.add_feature(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(bytes);

        let index = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.embed_text(text))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dimension: usize,
    ) -> Result<Self, MemoryError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            dimension,
        })
    }

    /// Builds a provider from config; `None` when no endpoint is set.
    ///
    /// The API key is read from the environment variable named by
    /// `api_key_env`.
    pub fn from_config(
        config: &EmbeddingConfig,
        dimension: usize,
    ) -> Result<Option<Self>, MemoryError> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self::new(endpoint, config.model.clone(), api_key, dimension).map(Some)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemoryError::Embedding(format!(
                "HTTP {} error: {}",
                status, error_text
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MemoryError::Embedding("response contained no embedding".to_string()))?;

        if embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hashing_embedder_is_normalized_and_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_text("Connection refused by upstream");
        let b = embedder.embed_text("Connection refused by upstream");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_embedder_ignores_volatile_tokens() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed_text("timeout talking to 10.0.0.1:443");
        let b = embedder.embed_text("timeout talking to 172.16.4.9:8443");
        assert_eq!(a, b);
    }

    #[test]
    fn test_related_messages_score_higher() {
        let embedder = HashingEmbedder::new(256);
        let base = embedder.embed_text("database is locked while writing checkpoint");
        let near = embedder.embed_text("database is locked while writing state");
        let far = embedder.embed_text("invalid api key provided");
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert!(embedder.embed_text("   ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_from_config_without_endpoint() {
        let provider = HttpEmbeddingProvider::from_config(&EmbeddingConfig::default(), 8).unwrap();
        assert!(provider.is_none());
    }
}
