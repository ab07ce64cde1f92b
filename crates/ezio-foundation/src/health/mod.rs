//! Health aggregation
//!
//! A [`HealthAggregator`] holds named [`HealthCheck`]s and reduces their
//! results to one status: any `Unhealthy` wins, then any `Degraded`,
//! otherwise `Healthy`. A check that errors, panics or overruns its timeout
//! is reported as `Unhealthy` and never aborts the run.

pub mod checks;
pub mod monitor;

pub use checks::{AcceleratorHealthCheck, CircuitHealthCheck, SystemMemoryCheck};
pub use monitor::HealthMonitor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Health thresholds and polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Period of the background health poll
    pub poll_interval_secs: u64,
    /// Budget for a single check
    pub check_timeout_ms: u64,
    /// Accelerators hotter than this are unhealthy
    pub temperature_threshold_celsius: f32,
    /// Telemetry older than this is considered lost
    pub staleness_threshold_secs: u64,
    /// Host memory usage above this percentage is degraded
    pub memory_threshold_percent: f32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            check_timeout_ms: 5_000,
            temperature_threshold_celsius: 90.0,
            staleness_threshold_secs: 30,
            memory_threshold_percent: 90.0,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }
}

/// Health status, ordered by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Partial functionality unavailable
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy, detail)
    }

    pub fn degraded(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded, detail)
    }

    pub fn unhealthy(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unhealthy, detail)
    }
}

/// Aggregated result of [`HealthAggregator::run_all`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// In registration order
    pub results: Vec<HealthCheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_results(results: Vec<HealthCheckResult>) -> Self {
        let status = results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            results,
            checked_at: Utc::now(),
        }
    }

    pub fn result(&self, name: &str) -> Option<&HealthCheckResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// A check that could not produce a result
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HealthCheckError(pub String);

impl From<String> for HealthCheckError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HealthCheckError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// A named health probe
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<HealthCheckResult, HealthCheckError>;
}

/// Registry of health checks
pub struct HealthAggregator {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Add `check`; a check with the same name is replaced in place
    pub fn register(&self, check: Arc<dyn HealthCheck>) {
        let mut checks = self.checks.write();
        match checks.iter().position(|c| c.name() == check.name()) {
            Some(index) => checks[index] = check,
            None => checks.push(check),
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut checks = self.checks.write();
        let before = checks.len();
        checks.retain(|c| c.name() != name);
        checks.len() != before
    }

    /// Registered check names in registration order
    pub fn names(&self) -> Vec<String> {
        self.checks.read().iter().map(|c| c.name().to_string()).collect()
    }

    /// Run every check concurrently and aggregate
    pub async fn run_all(&self) -> HealthReport {
        let checks: Vec<Arc<dyn HealthCheck>> = self.checks.read().clone();
        let timeout = self.timeout;
        let results = join_all(checks.iter().map(|check| run_one(check.as_ref(), timeout))).await;

        for result in results.iter().filter(|r| r.status != HealthStatus::Healthy) {
            warn!(
                check = %result.name,
                status = %result.status,
                detail = %result.detail,
                "health check not healthy"
            );
        }
        HealthReport::from_results(results)
    }
}

async fn run_one(check: &dyn HealthCheck, timeout: Duration) -> HealthCheckResult {
    let name = check.name().to_string();
    let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(check.check()).catch_unwind()).await;

    match outcome {
        Ok(Ok(Ok(mut result))) => {
            result.name = name;
            result
        }
        Ok(Ok(Err(e))) => HealthCheckResult::unhealthy(name, format!("check failed: {e}")),
        Ok(Err(panic)) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            HealthCheckResult::unhealthy(name, format!("check panicked: {message}"))
        }
        Err(_) => HealthCheckResult::unhealthy(name, format!("check timed out after {timeout:?}")),
    }
}
