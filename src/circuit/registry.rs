use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSettings, CircuitStats, StateObserver};
use crate::classify::ErrorCategory;

/// One breaker per key, created on first use.
///
/// Keys are colon-separated and end in a category, e.g. `"fetch:network"`
/// or `"category:resource"`. The category segment selects the config.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
    observer: Option<StateObserver>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
            observer: None,
        }
    }

    /// Observer attached to every breaker created from now on.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    /// Returns the breaker for `key`, creating it if needed.
    ///
    /// `config` only applies when the breaker does not exist yet.
    pub fn get(&self, key: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| self.config_for_key(key).clone());
            let breaker = CircuitBreaker::new(key, config);
            let breaker = match &self.observer {
                Some(observer) => breaker.with_observer(Arc::clone(observer)),
                None => breaker,
            };
            tracing::debug!(circuit = key, "created circuit breaker");
            Arc::new(breaker)
        });
        Arc::clone(entry.value())
    }

    /// The config a new breaker for `key` would get.
    pub fn config_for_key(&self, key: &str) -> &CircuitBreakerConfig {
        match category_of_key(key) {
            Some(category) => self.settings.for_category(category),
            None => &self.settings.default,
        }
    }

    pub fn remove(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(key).map(|(_, breaker)| breaker)
    }

    /// Forces every breaker closed.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn get_all_stats(&self) -> HashMap<String, CircuitStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Last key segment that names a category.
fn category_of_key(key: &str) -> Option<ErrorCategory> {
    key.rsplit(':').find_map(|segment| segment.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;

    #[test]
    fn test_get_returns_singleton() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("step1:network", None);
        let b = registry.get("step1:network", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_config_resolved_from_category_segment() {
        let registry = CircuitBreakerRegistry::default();
        assert_eq!(registry.get("category:llm", None).config().failure_threshold, 3);
        assert_eq!(registry.get("fetch:network", None).config().failure_threshold, 5);
        assert_eq!(
            registry.get("no-category-here", None).config(),
            &registry.settings().default
        );
    }

    #[test]
    fn test_explicit_config_only_on_creation() {
        let registry = CircuitBreakerRegistry::default();
        let custom = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let first = registry.get("x:network", Some(custom));
        let second = registry.get("x:network", Some(CircuitBreakerConfig::default()));
        assert_eq!(first.config().failure_threshold, 1);
        assert_eq!(second.config().failure_threshold, 1);
    }

    #[test]
    fn test_reset_all_and_stats() {
        let registry = CircuitBreakerRegistry::default();
        let breaker = registry.get("a:llm", None);
        for _ in 0..3 {
            breaker.record_failure();
        }
        registry.get("b:network", None);

        let stats = registry.get_all_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["a:llm"].state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_remove() {
        let registry = CircuitBreakerRegistry::default();
        registry.get("a:vcs", None);
        assert!(registry.remove("a:vcs").is_some());
        assert!(registry.is_empty());
    }
}
