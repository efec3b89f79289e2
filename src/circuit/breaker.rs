use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    CallError, CircuitBreakerConfig, CircuitOpenError, CircuitState, CircuitStats, StateChange,
};

/// Callback invoked on every state transition.
pub type StateObserver = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every transition so stale half-open slots are not released
    /// into a later half-open period.
    generation: u64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    stats: CircuitStats,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// A half-open permit holds one trial slot. The slot is handed back when the
/// result is recorded, or on drop if the call was cancelled first.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    slot: Option<u64>,
}

impl Permit<'_> {
    fn into_slot(mut self) -> Option<u64> {
        self.slot.take()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.slot.take() {
            let mut inner = self.breaker.inner.lock();
            release_slot(&mut inner, generation);
            debug!(circuit = %self.breaker.name, "half-open call abandoned");
        }
    }
}

fn release_slot(inner: &mut Inner, generation: u64) {
    if inner.state == CircuitState::HalfOpen && inner.generation == generation {
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }
}

/// Closed / Open / HalfOpen failure isolation for one resource.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    observer: Option<StateObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                generation: 0,
                last_failure: None,
                opened_at: None,
                stats: CircuitStats::new(),
            }),
            observer: None,
        }
    }

    /// Registers a transition observer.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose recovery timeout has elapsed
    /// moves to half-open here.
    pub fn state(&self) -> CircuitState {
        let (state, change) = {
            let mut inner = self.inner.lock();
            let change = self.poll_half_open(&mut inner, Instant::now());
            (inner.state, change)
        };
        self.notify(change);
        state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Runs `operation` if the circuit admits it and feeds the result back.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CallError::Open)?;

        let result = operation().await;
        let slot = permit.into_slot();
        match result {
            Ok(value) => {
                self.on_success(slot);
                Ok(value)
            }
            Err(error) => {
                self.on_failure(slot);
                Err(CallError::Failed(error))
            }
        }
    }

    /// Checks admission without running anything, counting the call.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        self.try_acquire().map(drop)
    }

    /// Records a success observed outside of [`call`](Self::call).
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Records a failure observed outside of [`call`](Self::call).
    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    /// Forces the circuit closed. Lifetime counters are kept.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.last_failure = None;
            if inner.state != CircuitState::Closed {
                Some(self.transition(&mut inner, CircuitState::Closed, Instant::now()))
            } else {
                None
            }
        };
        self.notify(change);
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let (stats, change) = {
            let mut inner = self.inner.lock();
            let change = self.poll_half_open(&mut inner, now);
            let mut stats = inner.stats.clone();
            stats.state = inner.state;
            if let Some(opened_at) = inner.opened_at {
                stats.time_open += now.saturating_duration_since(opened_at);
            }
            (stats, change)
        };
        self.notify(change);
        stats
    }

    fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let (result, change) = {
            let mut inner = self.inner.lock();
            inner.stats.total_calls += 1;
            let change = self.poll_half_open(&mut inner, now);

            let state = inner.state;
            let result = match state {
                CircuitState::Closed => Ok(Permit {
                    breaker: self,
                    slot: None,
                }),
                CircuitState::HalfOpen if inner.half_open_in_flight < self.config.half_open_max_calls => {
                    inner.half_open_in_flight += 1;
                    Ok(Permit {
                        breaker: self,
                        slot: Some(inner.generation),
                    })
                }
                CircuitState::HalfOpen => {
                    inner.stats.rejected_calls += 1;
                    Err(self.open_error(Duration::ZERO))
                }
                CircuitState::Open => {
                    inner.stats.rejected_calls += 1;
                    let elapsed = inner
                        .last_failure
                        .map(|at| now.saturating_duration_since(at))
                        .unwrap_or_default();
                    Err(self.open_error(self.config.recovery_timeout().saturating_sub(elapsed)))
                }
            };
            (result, change)
        };
        self.notify(change);

        if let Err(e) = &result {
            debug!(circuit = %self.name, recovery_time = ?e.recovery_time, "call rejected");
        }
        result
    }

    fn open_error(&self, recovery_time: Duration) -> CircuitOpenError {
        CircuitOpenError {
            circuit_name: self.name.clone(),
            recovery_time,
        }
    }

    fn on_success(&self, slot: Option<u64>) {
        let change = {
            let mut inner = self.inner.lock();
            inner.stats.successful_calls += 1;
            inner.stats.last_success_at = Some(Utc::now());
            if let Some(generation) = slot {
                release_slot(&mut inner, generation);
            }
            let state = inner.state;

            match state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        Some(self.transition(&mut inner, CircuitState::Closed, Instant::now()))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    fn on_failure(&self, slot: Option<u64>) {
        let now = Instant::now();
        let change = {
            let mut inner = self.inner.lock();
            inner.stats.failed_calls += 1;
            inner.stats.last_failure_at = Some(Utc::now());
            inner.last_failure = Some(now);
            if let Some(generation) = slot {
                release_slot(&mut inner, generation);
            }
            let state = inner.state;

            match state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        Some(self.transition(&mut inner, CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Some(self.transition(&mut inner, CircuitState::Open, now)),
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    fn poll_half_open(&self, inner: &mut Inner, now: Instant) -> Option<StateChange> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let last_failure = inner.last_failure?;
        if now.saturating_duration_since(last_failure) >= self.config.recovery_timeout() {
            Some(self.transition(inner, CircuitState::HalfOpen, now))
        } else {
            None
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) -> StateChange {
        let from = inner.state;
        if let Some(opened_at) = inner.opened_at.take() {
            inner.stats.time_open += now.saturating_duration_since(opened_at);
        }
        if to == CircuitState::Open {
            inner.opened_at = Some(now);
        }

        inner.state = to;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        inner.generation += 1;

        let at = Utc::now();
        inner.stats.state_changes += 1;
        inner.stats.last_state_change_at = Some(at);

        match to {
            CircuitState::Open => warn!(circuit = %self.name, %from, "circuit opened"),
            CircuitState::HalfOpen => debug!(circuit = %self.name, "circuit half-open"),
            CircuitState::Closed => info!(circuit = %self.name, %from, "circuit closed"),
        }

        StateChange {
            circuit_name: self.name.clone(),
            from,
            to,
            at,
        }
    }

    fn notify(&self, change: Option<StateChange>) {
        if let (Some(observer), Some(change)) = (&self.observer, change) {
            observer(&change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_seconds: 10.0,
            success_threshold: 2,
            half_open_max_calls: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        breaker.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    // ==== State Machine Tests ====

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..2 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("t", config());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_without_running_when_open() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let ran = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Open(_))));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let stats = breaker.stats();
        assert_eq!(stats.rejected_calls, 1);
        assert_eq!(stats.total_calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_error_reports_remaining_time() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(4)).await;

        match breaker.check() {
            Err(e) => {
                assert_eq!(e.circuit_name, "t");
                assert_eq!(e.recovery_time, Duration::from_secs(6));
            }
            Ok(()) => panic!("expected rejection"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_calls() {
        let breaker = Arc::new(CircuitBreaker::new("t", config()));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let pending = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = rx.await;
                        Ok::<(), &'static str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let second = succeed(&breaker).await;
        assert!(matches!(second, Err(CallError::Open(_))));

        tx.send(()).unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_frees_its_slot() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let slow = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), &'static str>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow)
            .await
            .is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_does_not_free_a_later_slot() {
        let breaker = Arc::new(CircuitBreaker::new("t", config()));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        // first half-open period: a call is admitted, then the circuit is
        // reopened from outside while it is still running
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let pending = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = rx.await;
                        Ok::<(), &'static str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // second half-open period: take the only slot, then abort the old
        // call; its slot belongs to the earlier period
        let (tx2, rx2) = tokio::sync::oneshot::channel::<()>();
        let second = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = rx2.await;
                        Ok::<(), &'static str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        pending.abort();
        let _ = pending.await;
        drop(tx);

        assert!(matches!(succeed(&breaker).await, Err(CallError::Open(_))));
        tx2.send(()).unwrap();
        second.await.unwrap().unwrap();
    }

    // ==== Stats and Observer Tests ====

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_time_open() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failed_calls, 3);
        assert_eq!(stats.state_changes, 1);
        assert_eq!(stats.time_open, Duration::from_secs(5));
        assert!(stats.last_failure_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_transitions() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let breaker = CircuitBreaker::new("t", config())
            .with_observer(Arc::new(move |change: &StateChange| sink.lock().push(change.to)));

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.state();
        breaker.reset();

        assert_eq!(
            *seen.lock(),
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[test]
    fn test_record_outside_call() {
        let breaker = CircuitBreaker::new("t", config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
    }
}
