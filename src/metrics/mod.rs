//! Recovery metrics.
//!
//! Thread-safe counters fed by the recovery engine and the circuit breaker
//! registry, with a serializable snapshot for reporting.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit::{CircuitState, StateChange};
use crate::classify::{ErrorCategory, RecoveryTier};
use crate::recovery::RecoveryResult;

/// Duration statistics over recoveries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    /// Number of samples
    pub count: u64,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    /// Sum of all durations (for calculating mean)
    pub total: Duration,
}

impl DurationStats {
    /// Add a new duration sample.
    pub fn add_sample(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.mean = self.total.div_f64(self.count as f64);

        if self.count == 1 {
            self.min = duration;
            self.max = duration;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
        }
    }
}

/// Point-in-time copy of all recovery counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub by_result: HashMap<RecoveryResult, u64>,
    pub by_final_tier: HashMap<RecoveryTier, u64>,
    pub by_category: HashMap<ErrorCategory, u64>,
    /// Handler runs per tier
    pub tier_attempts: HashMap<RecoveryTier, u64>,
    /// Successful handler runs per tier
    pub tier_successes: HashMap<RecoveryTier, u64>,
    pub loop_detections: u64,
    /// Breaker transitions by target state
    pub circuit_transitions: HashMap<CircuitState, u64>,
    /// Estimated token cost of tiers 2 and 3
    pub total_token_cost: u64,
    pub duration: DurationStats,
}

impl MetricsSnapshot {
    /// Calculate the overall success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_recoveries == 0 {
            return 0.0;
        }
        self.successful_recoveries as f64 / self.total_recoveries as f64
    }

    /// Get the most common error category.
    pub fn most_common_category(&self) -> Option<ErrorCategory> {
        self.by_category
            .iter()
            .max_by_key(|(category, count)| (**count, std::cmp::Reverse(**category)))
            .map(|(category, _)| *category)
    }

    /// Success rate of a single tier's handler.
    pub fn tier_success_rate(&self, tier: RecoveryTier) -> f64 {
        let attempts = self.tier_attempts.get(&tier).copied().unwrap_or(0);
        if attempts == 0 {
            return 0.0;
        }
        self.tier_successes.get(&tier).copied().unwrap_or(0) as f64 / attempts as f64
    }
}

/// Thread-safe metrics collector shared between the engine and observers.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    inner: Arc<RwLock<MetricsSnapshot>>,
}

impl RecoveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one handler run.
    pub fn record_tier_attempt(&self, tier: RecoveryTier, success: bool) {
        let mut inner = self.inner.write();
        *inner.tier_attempts.entry(tier).or_insert(0) += 1;
        if success {
            *inner.tier_successes.entry(tier).or_insert(0) += 1;
        }
    }

    /// Record a finished `recover()` call.
    pub fn record_recovery(
        &self,
        result: RecoveryResult,
        final_tier: RecoveryTier,
        category: ErrorCategory,
        duration: Duration,
        token_cost: u64,
    ) {
        let mut inner = self.inner.write();
        inner.total_recoveries += 1;
        if result == RecoveryResult::Success {
            inner.successful_recoveries += 1;
        }
        if result == RecoveryResult::LoopDetected {
            inner.loop_detections += 1;
        }
        *inner.by_result.entry(result).or_insert(0) += 1;
        *inner.by_final_tier.entry(final_tier).or_insert(0) += 1;
        *inner.by_category.entry(category).or_insert(0) += 1;
        inner.total_token_cost += token_cost;
        inner.duration.add_sample(duration);
    }

    /// Record a breaker transition.
    pub fn record_state_change(&self, change: &StateChange) {
        *self
            .inner
            .write()
            .circuit_transitions
            .entry(change.to)
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.read().clone()
    }

    pub fn reset(&self) {
        *self.inner.write() = MetricsSnapshot::default();
    }
}

/// Format a snapshot for display.
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::from("## Recovery Metrics\n\n");

    output.push_str(&format!(
        "- **Recoveries**: {} ({} successful)\n",
        snapshot.total_recoveries, snapshot.successful_recoveries
    ));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        snapshot.success_rate() * 100.0
    ));
    output.push_str(&format!(
        "- **Loop Detections**: {}\n",
        snapshot.loop_detections
    ));
    output.push_str(&format!(
        "- **Token Cost**: {}\n",
        snapshot.total_token_cost
    ));
    if snapshot.duration.count > 0 {
        output.push_str(&format!(
            "- **Duration**: mean {:.2}s, min {:.2}s, max {:.2}s\n",
            snapshot.duration.mean.as_secs_f64(),
            snapshot.duration.min.as_secs_f64(),
            snapshot.duration.max.as_secs_f64()
        ));
    }
    if let Some(category) = snapshot.most_common_category() {
        output.push_str(&format!("- **Most Common Category**: {}\n", category));
    }

    let mut tiers: Vec<_> = snapshot.tier_attempts.keys().copied().collect();
    if !tiers.is_empty() {
        tiers.sort();
        output.push_str("\n### Tiers\n");
        for tier in tiers {
            output.push_str(&format!(
                "- {}: {} attempts, {:.1}% success\n",
                tier,
                snapshot.tier_attempts[&tier],
                snapshot.tier_success_rate(tier) * 100.0
            ));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_duration_stats() {
        let mut stats = DurationStats::default();
        stats.add_sample(Duration::from_secs(1));
        stats.add_sample(Duration::from_secs(3));
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, Duration::from_secs(2));
        assert_eq!(stats.min, Duration::from_secs(1));
        assert_eq!(stats.max, Duration::from_secs(3));
    }

    #[test]
    fn test_record_recovery() {
        let metrics = RecoveryMetrics::new();
        metrics.record_recovery(
            RecoveryResult::Success,
            RecoveryTier::Tier1,
            ErrorCategory::Network,
            Duration::from_millis(200),
            0,
        );
        metrics.record_recovery(
            RecoveryResult::LoopDetected,
            RecoveryTier::Tier4,
            ErrorCategory::Network,
            Duration::ZERO,
            0,
        );
        metrics.record_recovery(
            RecoveryResult::Escalated,
            RecoveryTier::Tier4,
            ErrorCategory::Auth,
            Duration::from_secs(1),
            550,
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_recoveries, 3);
        assert!((snapshot.success_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.loop_detections, 1);
        assert_eq!(snapshot.total_token_cost, 550);
        assert_eq!(snapshot.most_common_category(), Some(ErrorCategory::Network));
        assert_eq!(snapshot.by_final_tier[&RecoveryTier::Tier4], 2);
    }

    #[test]
    fn test_tier_success_rate() {
        let metrics = RecoveryMetrics::new();
        metrics.record_tier_attempt(RecoveryTier::Tier1, true);
        metrics.record_tier_attempt(RecoveryTier::Tier1, false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tier_success_rate(RecoveryTier::Tier1), 0.5);
        assert_eq!(snapshot.tier_success_rate(RecoveryTier::Tier3), 0.0);
    }

    #[test]
    fn test_state_changes_and_reset() {
        let metrics = RecoveryMetrics::new();
        metrics.record_state_change(&StateChange {
            circuit_name: "a:network".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            at: Utc::now(),
        });
        assert_eq!(metrics.snapshot().circuit_transitions[&CircuitState::Open], 1);
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RecoveryMetrics::new();
        metrics.record_tier_attempt(RecoveryTier::Tier2, true);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("tier_attempts"));
    }

    #[test]
    fn test_format_metrics() {
        let metrics = RecoveryMetrics::new();
        metrics.record_tier_attempt(RecoveryTier::Tier1, true);
        metrics.record_recovery(
            RecoveryResult::Success,
            RecoveryTier::Tier1,
            ErrorCategory::Llm,
            Duration::from_secs(2),
            0,
        );
        let text = format_metrics(&metrics.snapshot());
        assert!(text.contains("## Recovery Metrics"));
        assert!(text.contains("Most Common Category**: llm"));
        assert!(text.contains("tier1: 1 attempts"));
    }
}
