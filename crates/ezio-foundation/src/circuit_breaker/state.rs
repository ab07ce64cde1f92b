//! Circuit breaker state machine
//!
//! - Closed: calls pass; consecutive failures are counted
//! - Open: calls are rejected without running the operation
//! - Half-Open: exactly one trial call runs; its outcome closes or reopens
//!
//! All bookkeeping for one breaker lives behind a single short mutex that is
//! never held across an `.await`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::CircuitBreakerConfig;
use super::metrics::{CircuitBreakerMetrics, StateTransition};
use crate::error::ControlError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Normal operation - calls are allowed
    Closed,
    /// Calls are rejected
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Closed => write!(f, "closed"),
            State::Open => write!(f, "open"),
            State::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    Probe,
}

/// Circuit breaker guarding one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            metrics: CircuitBreakerMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    /// Current state; an open circuit whose cooldown has elapsed reports
    /// (and becomes) half-open
    pub fn state(&self) -> State {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Run `operation` under the breaker
    ///
    /// While the circuit is open, or while another half-open trial is in
    /// flight, the future is dropped unpolled and `Open` is returned.
    /// Dropping the returned future mid-trial releases the trial slot and
    /// leaves the state untouched.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return operation
                .await
                .map_err(|source| CircuitBreakerError::Operation {
                    name: self.name.clone(),
                    source,
                });
        }

        let Some(admission) = self.admit() else {
            self.metrics.record_rejected();
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        };

        let mut slot = ProbeSlot {
            breaker: self,
            armed: admission == Admission::Probe,
        };
        let result = operation.await;
        slot.armed = false;

        match &result {
            Ok(_) => self.record_success(admission),
            Err(_) => self.record_failure(admission),
        }

        result.map_err(|source| CircuitBreakerError::Operation {
            name: self.name.clone(),
            source,
        })
    }

    /// Open the circuit now, regardless of failures
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        self.transition(&mut inner, State::Open);
    }

    /// Close the circuit now and clear the failure count
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        self.transition(&mut inner, State::Closed);
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner);
        match inner.state {
            State::Closed => Some(Admission::Pass),
            State::Open => None,
            State::HalfOpen if inner.probe_in_flight => None,
            State::HalfOpen => {
                inner.probe_in_flight = true;
                Some(Admission::Probe)
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        self.metrics.record_success();
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (State::Closed, _) => inner.consecutive_failures = 0,
            (State::HalfOpen, Admission::Probe) => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                self.transition(&mut inner, State::Closed);
            }
            // Outcome of a call admitted before the circuit opened
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        self.metrics.record_failure();
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (State::Closed, _) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, State::Open);
                }
            }
            (State::HalfOpen, Admission::Probe) => {
                inner.consecutive_failures += 1;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                self.transition(&mut inner, State::Open);
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn promote_if_cooled(&self, inner: &mut BreakerState) {
        if inner.state != State::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .is_none_or(|opened_at| opened_at.elapsed() >= self.config.cooldown());
        if cooled {
            inner.probe_in_flight = false;
            self.transition(inner, State::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: State) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.metrics.record_transition(StateTransition::new(from, to));
        match to {
            State::Open => warn!(
                dependency = %self.name,
                from = %from,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            ),
            _ => info!(dependency = %self.name, from = %from, to = %to, "circuit transition"),
        }
    }
}

/// Frees the half-open trial slot if the trial future is dropped early
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

/// Circuit breaker error types
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The call was rejected without running the operation
    Open { name: String },
    /// The operation ran and failed
    Operation { name: String, source: E },
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Operation { source, .. } => Some(source),
        }
    }

    /// `ControlError::CircuitOpen` for rejections
    pub fn as_control_error(&self) -> Option<ControlError> {
        match self {
            Self::Open { name } => Some(ControlError::CircuitOpen {
                dependency: name.clone(),
            }),
            Self::Operation { .. } => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name } => write!(f, "Circuit breaker '{}' is open", name),
            Self::Operation { name, source } => {
                write!(f, "Operation error in circuit breaker '{}': {}", name, source)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Operation { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const COOLDOWN: Duration = Duration::from_secs(10);

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_cooldown(COOLDOWN),
        )
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb
            .call(async { Err::<(), _>(io::Error::other("boom")) })
            .await;
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<io::Error>> {
        cb.call(async { Ok::<_, io::Error>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_open_the_circuit() {
        let cb = breaker(3);
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.consecutive_failures(), 2);

        fail(&cb).await;
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = breaker(3);
        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.consecutive_failures(), 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_running_operation() {
        let cb = breaker(1);
        fail(&cb).await;

        let ran = AtomicBool::new(false);
        let result = cb
            .call(async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(cb.metrics().total_rejected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_then_successful_probe_closes() {
        let cb = breaker(3);
        for _ in 0..3 {
            fail(&cb).await;
        }

        tokio::time::advance(COOLDOWN - Duration::from_millis(1)).await;
        assert_eq!(cb.state(), State::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.state(), State::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_cooldown() {
        let cb = breaker(1);
        fail(&cb).await;
        tokio::time::advance(COOLDOWN).await;

        fail(&cb).await;
        assert_eq!(cb.state(), State::Open);

        tokio::time::advance(COOLDOWN / 2).await;
        assert_eq!(cb.state(), State::Open);
        tokio::time::advance(COOLDOWN / 2).await;
        assert_eq!(cb.state(), State::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_flight() {
        let cb = breaker(1);
        fail(&cb).await;
        tokio::time::advance(COOLDOWN).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = cb.call(async move {
            let _ = rx.await;
            Ok::<_, io::Error>("probe")
        });
        tokio::pin!(probe);
        assert!(futures::poll!(&mut probe).is_pending());

        let second = succeed(&cb).await;
        assert!(second.unwrap_err().is_open());

        tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap(), "probe");
        assert_eq!(cb.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_frees_the_slot() {
        let cb = breaker(1);
        fail(&cb).await;
        tokio::time::advance(COOLDOWN).await;

        {
            let probe = cb.call(std::future::pending::<Result<(), io::Error>>());
            tokio::pin!(probe);
            assert!(futures::poll!(&mut probe).is_pending());
        }

        assert_eq!(cb.state(), State::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_close() {
        let cb = breaker(5);
        cb.force_open();
        assert!(succeed(&cb).await.unwrap_err().is_open());

        cb.force_close();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.metrics().total_transitions(), 2);
    }

    #[tokio::test]
    async fn test_disabled_breaker_always_passes() {
        let cb = CircuitBreaker::new(
            "off",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_enabled(false),
        );
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), State::Closed);
        succeed(&cb).await.unwrap();
    }

    #[test]
    fn test_open_error_maps_to_control_error() {
        let err: CircuitBreakerError<io::Error> = CircuitBreakerError::Open { name: "llm".into() };
        assert_eq!(
            err.as_control_error(),
            Some(ControlError::CircuitOpen {
                dependency: "llm".into()
            })
        );
        assert!(err.to_string().contains("open"));
    }
}
