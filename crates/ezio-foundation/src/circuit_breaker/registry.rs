//! Per-dependency breaker registry
//!
//! Breakers are created lazily on first use. Each dependency key owns its
//! own breaker and lock, so calls to different dependencies never contend.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use super::config::{CircuitBreakerConfig, CircuitBreakerSettings};
use super::metrics::CircuitBreakerMetricsSnapshot;
use super::state::{CircuitBreaker, CircuitBreakerError, State};

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub dependency: String,
    pub state: State,
    pub consecutive_failures: u32,
    pub metrics: CircuitBreakerMetricsSnapshot,
}

/// Lazily populated map of dependency key to breaker
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Every dependency uses `config`
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self::new(CircuitBreakerSettings {
            defaults: config,
            ..Default::default()
        })
    }

    /// Breaker for `dependency`, created on first use
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        let config = self.settings.for_dependency(dependency).clone();
        Arc::clone(
            self.breakers
                .entry(dependency.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, config)))
                .value(),
        )
    }

    /// Replace the breaker for `dependency` with a fresh one using `config`
    pub fn configure(&self, dependency: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(dependency, config));
        self.breakers
            .insert(dependency.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Run `operation` under the breaker for `dependency`
    pub async fn call<F, T, E>(
        &self,
        dependency: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(dependency);
        breaker.call(operation).await
    }

    /// State of an existing breaker; `None` if the dependency was never used
    pub fn state(&self, dependency: &str) -> Option<State> {
        self.breakers.get(dependency).map(|b| b.state())
    }

    pub fn force_open(&self, dependency: &str) {
        self.breaker(dependency).force_open();
    }

    pub fn force_close(&self, dependency: &str) {
        self.breaker(dependency).force_close();
    }

    /// Dependencies whose circuit is currently open, sorted
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() == State::Open)
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }

    /// Snapshot of every breaker, sorted by dependency
    pub fn snapshot(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<_> = breakers
            .iter()
            .map(|b| CircuitBreakerSnapshot {
                dependency: b.name().to_string(),
                state: b.state(),
                consecutive_failures: b.consecutive_failures(),
                metrics: b.metrics().snapshot(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
