//! Circuit breaker metrics
//!
//! Counters are plain atomics; the transition history is bounded.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::state::State;

const TRANSITION_HISTORY: usize = 32;

/// State transition event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: State,
    pub to_state: State,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(from_state: State, to_state: State) -> Self {
        Self {
            from_state,
            to_state,
            at: Utc::now(),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    /// Calls turned away without running the operation
    rejected: AtomicU64,
    transitions: AtomicU64,
    history: Mutex<VecDeque<StateTransition>>,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self, transition: StateTransition) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock();
        if history.len() == TRANSITION_HISTORY {
            history.pop_front();
        }
        history.push_back(transition);
    }

    pub fn total_successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn total_transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Failure rate as a percentage (0-100) of completed calls
    pub fn failure_rate(&self) -> f64 {
        let failures = self.total_failures();
        let total = self.total_successes() + failures;
        if total == 0 {
            return 0.0;
        }
        failures as f64 / total as f64 * 100.0
    }

    /// Most recent transitions, oldest first
    pub fn recent_transitions(&self) -> Vec<StateTransition> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            total_successes: self.total_successes(),
            total_failures: self.total_failures(),
            total_rejected: self.total_rejected(),
            total_transitions: self.total_transitions(),
            failure_rate: self.failure_rate(),
            last_transition: self.history.lock().back().cloned(),
        }
    }
}

/// Serializable copy of [`CircuitBreakerMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub total_transitions: u64,
    pub failure_rate: f64,
    pub last_transition: Option<StateTransition>,
}
