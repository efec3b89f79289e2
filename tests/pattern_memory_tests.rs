//! Pattern memory and HTTP collaborator tests.

use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use remedy::memory::{
    EmbeddingProvider, HttpEmbeddingProvider, InMemoryVectorBackend, PatternMemoryConfig,
};
use remedy::recovery::WebhookEscalationSink;
use remedy::{
    ErrorClassifier, ErrorKind, ErrorPatternStore, Fault, RecoveryConfig, RecoveryEngine,
    RecoveryRequest, RecoveryResult, RecoveryTier, ResolutionStep,
};

fn retry_steps() -> Vec<ResolutionStep> {
    vec![ResolutionStep::new("retry_with_backoff", RecoveryTier::Tier1)]
}

fn small_config(vector_size: usize) -> PatternMemoryConfig {
    let mut config = PatternMemoryConfig::default();
    config.vector_backend.vector_size = vector_size;
    config
}

#[tokio::test]
async fn test_stored_pattern_is_found_as_exact_match() {
    let store = ErrorPatternStore::in_memory(PatternMemoryConfig::default());
    let fault = Fault::new(ErrorKind::ConnectionError, "Connection refused by 10.0.0.5:5432");

    let id = store
        .store_pattern(&fault, &retry_steps(), true, None, None)
        .await
        .unwrap();
    let matches = store.find_similar_patterns(&fault, None, None).await;

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].pattern.id, id);
    assert_eq!(matches[0].similarity_score, 1.0);
    assert!(matches[0].is_exact_match);
}

#[tokio::test]
async fn test_effectiveness_needs_two_attempts() {
    let store = ErrorPatternStore::in_memory(PatternMemoryConfig::default());
    let fault = Fault::new(ErrorKind::RuntimeError, "database is locked");
    let min_rate = store.config().storage.min_success_rate;

    let id = store
        .store_pattern(&fault, &retry_steps(), true, None, None)
        .await
        .unwrap();
    let once = store.get_pattern(&id).await.unwrap();
    assert_eq!((once.success_count, once.attempt_count), (1, 1));
    assert!(!once.is_effective(min_rate));

    assert!(store.record_resolution_outcome(&id, true).await);
    let twice = store.get_pattern(&id).await.unwrap();
    assert_eq!((twice.success_count, twice.attempt_count), (2, 2));
    assert!(twice.is_effective(min_rate));
}

#[tokio::test]
async fn test_similar_faults_match_within_category() {
    let store = ErrorPatternStore::in_memory(PatternMemoryConfig::default());
    let classifier = ErrorClassifier::new();

    let seen = Fault::new(
        ErrorKind::RuntimeError,
        "database is locked while writing checkpoint state for workflow",
    );
    store
        .store_pattern(&seen, &retry_steps(), true, None, None)
        .await
        .unwrap();

    let similar = Fault::new(
        ErrorKind::RuntimeError,
        "database is locked while writing checkpoint state for run",
    );
    let classification = classifier.classify(&similar, None);
    let matches = store
        .find_similar_patterns(&similar, Some(&classification), None)
        .await;
    assert_eq!(matches.len(), 1);
    assert!(!matches[0].is_exact_match);
    assert!(matches[0].similarity_score >= 0.75);
    assert!(matches[0].similarity_score < 1.0);

    // same words, different category: filtered out
    let auth = Fault::new(ErrorKind::PermissionDenied, "Permission denied");
    assert!(store.find_similar_patterns(&auth, None, None).await.is_empty());
}

#[tokio::test]
async fn test_proven_failures_are_dropped_from_results() {
    let store = ErrorPatternStore::in_memory(PatternMemoryConfig::default());
    let fault = Fault::new(ErrorKind::RuntimeError, "too many open files in worker pool");
    let id = store
        .store_pattern(&fault, &retry_steps(), false, None, None)
        .await
        .unwrap();
    store.record_resolution_outcome(&id, false).await;
    store.record_resolution_outcome(&id, false).await;

    let related = Fault::new(ErrorKind::RuntimeError, "too many open files in worker queue");
    assert!(store.find_similar_patterns(&related, None, None).await.is_empty());

    // the exact signature is still reported so callers can see its record
    let exact = store.find_similar_patterns(&fault, None, None).await;
    assert_eq!(exact.len(), 1);
    assert!(exact[0].is_exact_match);
}

#[tokio::test]
async fn test_http_embedding_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "embedding": [0.5, 0.5, 0.5, 0.5] }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpEmbeddingProvider::new(
        format!("{}/v1/embeddings", server.uri()),
        "text-embedding-3-small",
        Some("sk-test".to_string()),
        4,
    )
    .unwrap();

    let vector = provider.embed("connection refused").await.unwrap();
    assert_eq!(vector, vec![0.5, 0.5, 0.5, 0.5]);
}

#[tokio::test]
async fn test_http_embedding_dimension_is_checked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "embedding": [1.0, 0.0] }]
        })))
        .mount(&server)
        .await;

    let provider = HttpEmbeddingProvider::new(server.uri(), "m", None, 4).unwrap();
    assert!(provider.embed("x").await.is_err());
}

#[tokio::test]
async fn test_store_degrades_when_embedding_service_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let embedder = HttpEmbeddingProvider::new(server.uri(), "m", None, 8).unwrap();
    let store = ErrorPatternStore::new(
        small_config(8),
        Some(Arc::new(embedder)),
        Some(Arc::new(InMemoryVectorBackend::new())),
    );
    let fault = Fault::new(ErrorKind::Timeout, "read timed out");

    assert!(store.store_pattern(&fault, &retry_steps(), true, None, None).await.is_none());
    assert!(store.find_similar_patterns(&fault, None, None).await.is_empty());
}

#[tokio::test]
async fn test_store_with_http_embedder() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "embedding": [0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0] }]
        })))
        .mount(&server)
        .await;

    let embedder = HttpEmbeddingProvider::new(server.uri(), "m", None, 8).unwrap();
    let store = ErrorPatternStore::new(
        small_config(8),
        Some(Arc::new(embedder)),
        Some(Arc::new(InMemoryVectorBackend::new())),
    );
    let fault = Fault::new(ErrorKind::Timeout, "read timed out");

    let id = store
        .store_pattern(&fault, &retry_steps(), true, None, None)
        .await
        .unwrap();
    let matches = store.find_similar_patterns(&fault, None, None).await;
    assert_eq!(matches[0].pattern.id, id);
    assert!(matches[0].is_exact_match);
}

#[tokio::test]
async fn test_cleanup_keeps_healthy_patterns() {
    let store = ErrorPatternStore::in_memory(PatternMemoryConfig::default());
    let healthy = Fault::new(ErrorKind::RuntimeError, "database is locked");
    let broken = Fault::new(ErrorKind::RuntimeError, "no space left on device");

    let keep = store
        .store_pattern(&healthy, &retry_steps(), true, None, None)
        .await
        .unwrap();
    let drop = store
        .store_pattern(&broken, &retry_steps(), false, None, None)
        .await
        .unwrap();
    for _ in 0..4 {
        store.record_resolution_outcome(&drop, false).await;
    }

    assert_eq!(store.cleanup_stale_patterns().await, 1);
    assert!(store.get_pattern(&keep).await.is_some());
    assert!(store.get_pattern(&drop).await.is_none());
}

#[tokio::test]
async fn test_webhook_sink_returns_tracking_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/incidents"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "tracking_id": "INC-42" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = RecoveryConfig::default();
    config.tiers.tier_4.escalation_target = Some(format!("{}/incidents", server.uri()));
    let engine = RecoveryEngine::new(config).unwrap();

    let outcome = engine
        .recover::<()>(
            Fault::new(ErrorKind::PermissionDenied, "Permission denied"),
            RecoveryRequest::new().with_workflow("wf"),
            None,
        )
        .await;

    assert_eq!(outcome.result, RecoveryResult::Escalated);
    assert_eq!(outcome.context.incident_tracking_id.as_deref(), Some("INC-42"));

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["category"], "auth");
    assert_eq!(body["workflow_id"], "wf");
    assert_eq!(body["attempts"][0]["tier"], "Tier3");
}

#[tokio::test]
async fn test_webhook_sink_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let mut config = RecoveryConfig::default();
    config.tiers.tier_4.escalation_target = Some(server.uri());
    let engine = RecoveryEngine::new(config).unwrap();

    let outcome = engine
        .recover::<()>(
            Fault::new(ErrorKind::PermissionDenied, "Permission denied"),
            RecoveryRequest::new(),
            None,
        )
        .await;

    // the hand-off failed, so nobody was reached
    assert_eq!(outcome.result, RecoveryResult::Failure);
    assert_eq!(outcome.final_tier, RecoveryTier::Tier4);
    let last = outcome.context.attempts.last().unwrap();
    assert!(last.detail.as_deref().unwrap_or("").contains("HTTP 500"));
    assert!(outcome.context.incident_tracking_id.is_none());

    let sink = WebhookEscalationSink::new(server.uri()).unwrap();
    assert_eq!(sink.url(), server.uri());
}
