//! remedy - tiered self-healing error recovery
//!
//! Classifies faults raised inside agent workflows and drives them up a
//! ladder of increasingly expensive recovery tiers: heuristic triage,
//! automatic retry with backoff, learned resolutions, agent diagnosis and,
//! last, a hand-off to a human. Circuit breakers isolate failing resources
//! and loop protection stops futile recovery cycles.
//!
//! ```no_run
//! use remedy::{operation, Fault, ErrorKind, RecoveryConfig, RecoveryEngine, RecoveryRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RecoveryEngine::new(RecoveryConfig::default())?;
//! let fetch = operation(|| async { Ok::<_, Fault>("payload") });
//!
//! let outcome = engine
//!     .recover(
//!         Fault::new(ErrorKind::ConnectionError, "Connection refused"),
//!         RecoveryRequest::new().with_step("fetch"),
//!         Some(fetch),
//!     )
//!     .await;
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod classify;
pub mod config;
pub mod fault;
pub mod logging;
pub mod loop_guard;
pub mod memory;
pub mod metrics;
pub mod recovery;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use classify::{
    ErrorCategory, ErrorClassification, ErrorClassifier, ErrorSeverity, ErrorSignature,
    RecoveryTier,
};
pub use config::{ConfigError, RecoveryConfig};
pub use fault::{ErrorKind, Fault};
pub use loop_guard::{LoopProtector, LoopVerdict};
pub use memory::{ErrorPattern, ErrorPatternStore, PatternMatch, ResolutionStep};
pub use metrics::{MetricsSnapshot, RecoveryMetrics};
pub use recovery::{
    operation, with_recovery, Operation, RecoveryEngine, RecoveryError, RecoveryMiddleware,
    RecoveryOutcome, RecoveryRequest, RecoveryResult,
};
pub use retry::{RetryConfig, RetryPolicy};
