//! Built-in health checks

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{HealthCheck, HealthCheckError, HealthCheckResult};
use crate::accelerator::AcceleratorRegistry;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::ControlError;

/// Temperature and telemetry freshness of every accelerator
///
/// Unhealthy when any device runs hotter than the threshold or its telemetry
/// is older than the staleness threshold. A device whose last read failed
/// but whose data is still within the threshold is degraded. No devices at
/// all is degraded: allocation is off but the process is fine.
pub struct AcceleratorHealthCheck {
    registry: Arc<AcceleratorRegistry>,
    temperature_threshold_celsius: f32,
    staleness_threshold: Duration,
}

impl AcceleratorHealthCheck {
    pub const NAME: &'static str = "accelerators";

    pub fn new(
        registry: Arc<AcceleratorRegistry>,
        temperature_threshold_celsius: f32,
        staleness_threshold: Duration,
    ) -> Self {
        Self {
            registry,
            temperature_threshold_celsius,
            staleness_threshold,
        }
    }
}

#[async_trait]
impl HealthCheck for AcceleratorHealthCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Ok(HealthCheckResult::degraded(
                Self::NAME,
                "no accelerators found; allocation disabled",
            ));
        }

        let now = Instant::now();
        let mut critical = Vec::new();
        let mut warnings = Vec::new();

        for state in snapshot.iter() {
            let age = state.telemetry_age(now);
            if age > self.staleness_threshold {
                critical.push(
                    ControlError::StaleTelemetry {
                        accelerator: state.id,
                        age,
                    }
                    .to_string(),
                );
            } else if state.stale {
                warnings.push(format!("{}: last telemetry read failed", state.id));
            }

            if state.temperature_celsius > self.temperature_threshold_celsius {
                critical.push(format!(
                    "{}: temperature {:.1}°C above {:.1}°C",
                    state.id, state.temperature_celsius, self.temperature_threshold_celsius
                ));
            }
        }

        let result = if !critical.is_empty() {
            critical.extend(warnings);
            HealthCheckResult::unhealthy(Self::NAME, critical.join("; "))
        } else if !warnings.is_empty() {
            HealthCheckResult::degraded(Self::NAME, warnings.join("; "))
        } else {
            let hottest = snapshot
                .iter()
                .map(|s| s.temperature_celsius)
                .fold(f32::MIN, f32::max);
            HealthCheckResult::healthy(
                Self::NAME,
                format!("{} accelerators, hottest {:.1}°C", snapshot.len(), hottest),
            )
        };
        Ok(result)
    }
}

/// Degraded while any circuit is open
pub struct CircuitHealthCheck {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl CircuitHealthCheck {
    pub const NAME: &'static str = "circuits";

    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl HealthCheck for CircuitHealthCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
        let open = self.breakers.open_circuits();
        Ok(if open.is_empty() {
            HealthCheckResult::healthy(
                Self::NAME,
                format!("{} circuits closed", self.breakers.len()),
            )
        } else {
            HealthCheckResult::degraded(Self::NAME, format!("open: {}", open.join(", ")))
        })
    }
}

/// Host memory pressure, read through `sysinfo`
pub struct SystemMemoryCheck {
    threshold_percent: f32,
}

impl SystemMemoryCheck {
    pub const NAME: &'static str = "system_memory";

    pub fn new(threshold_percent: f32) -> Self {
        Self { threshold_percent }
    }
}

#[async_trait]
impl HealthCheck for SystemMemoryCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
        let (total, used) = tokio::task::spawn_blocking(|| {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            (sys.total_memory(), sys.used_memory())
        })
        .await
        .map_err(|e| HealthCheckError(format!("memory probe aborted: {e}")))?;

        if total == 0 {
            return Err("host memory information unavailable".into());
        }

        let percent = used as f64 / total as f64 * 100.0;
        let detail = format!(
            "{:.1}% of {} MiB in use",
            percent,
            total / (1024 * 1024)
        );
        Ok(if percent > self.threshold_percent as f64 {
            HealthCheckResult::degraded(Self::NAME, detail)
        } else {
            HealthCheckResult::healthy(Self::NAME, detail)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{AcceleratorId, DeviceDescriptor, DeviceReading};
    use crate::health::HealthStatus;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn registry(temps: &[f32]) -> Arc<AcceleratorRegistry> {
        let registry = AcceleratorRegistry::from_descriptors(
            (0..temps.len())
                .map(|i| DeviceDescriptor {
                    id: AcceleratorId(i as u32),
                    name: format!("gpu-{i}"),
                    total_memory_bytes: 8 * GIB,
                })
                .collect(),
        );
        let now = Instant::now();
        let states = registry
            .snapshot()
            .iter()
            .zip(temps)
            .map(|(s, t)| s.with_reading(&DeviceReading::new(4 * GIB, 10.0, *t, 50.0), now))
            .collect();
        registry.publish(states);
        Arc::new(registry)
    }

    fn accel_check(registry: Arc<AcceleratorRegistry>) -> AcceleratorHealthCheck {
        AcceleratorHealthCheck::new(registry, 90.0, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cool_fresh_accelerators_are_healthy() {
        let result = accel_check(registry(&[60.0, 70.0])).check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert!(result.detail.contains("70.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_accelerator_is_unhealthy() {
        let result = accel_check(registry(&[60.0, 95.5])).check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.detail.contains("gpu1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_telemetry_is_unhealthy() {
        let registry = registry(&[60.0]);
        tokio::time::advance(Duration::from_secs(31)).await;

        let result = accel_check(registry).check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.detail.contains("stale"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_failed_read_is_degraded() {
        let registry = registry(&[60.0]);
        let stale = registry.snapshot().iter().map(|s| s.marked_stale()).collect();
        registry.publish(stale);

        let result = accel_check(registry).check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_no_accelerators_is_degraded() {
        let check = accel_check(Arc::new(AcceleratorRegistry::empty()));
        assert_eq!(check.check().await.unwrap().status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_degrades() {
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let check = CircuitHealthCheck::new(Arc::clone(&breakers));
        breakers.breaker("search");
        assert_eq!(check.check().await.unwrap().status, HealthStatus::Healthy);

        breakers.force_open("llm");
        let result = check.check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(result.detail, "open: llm");
    }

    #[tokio::test]
    async fn test_system_memory_thresholds() {
        let lenient = SystemMemoryCheck::new(100.0).check().await.unwrap();
        assert_eq!(lenient.status, HealthStatus::Healthy);

        let strict = SystemMemoryCheck::new(0.0).check().await.unwrap();
        assert_eq!(strict.status, HealthStatus::Degraded);
    }
}
