//! Background telemetry sampler
//!
//! Owns the only write path into the [`AcceleratorRegistry`]. A pass reads
//! every device concurrently on the blocking pool, then publishes one new
//! snapshot. A device whose read fails or times out is carried over with
//! its last-known values and flagged stale; the pass itself never fails.
//!
//! A read that times out keeps running on its blocking thread. Until it
//! returns, its device is not read again and stays stale, so a hung driver
//! costs at most one blocking thread per device.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::{self, HardwareProbe, ProbeError};
use super::{AcceleratorId, AcceleratorRegistry};
use crate::error::ControlError;

/// Sampler timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Period between sampling passes
    pub sampling_interval_ms: u64,
    /// Upper bound on a single hardware call
    pub query_timeout_ms: u64,
    /// How long shutdown waits for background tasks before aborting them
    pub shutdown_grace_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 5_000,
            query_timeout_ms: 2_000,
            shutdown_grace_ms: 3_000,
        }
    }
}

impl TelemetryConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Outcome of one sampling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplingReport {
    pub sampled: Vec<AcceleratorId>,
    pub stale: Vec<AcceleratorId>,
}

impl SamplingReport {
    pub fn is_complete(&self) -> bool {
        self.stale.is_empty()
    }
}

/// Devices with a hardware read still running on the blocking pool
type InFlight = Arc<Mutex<HashSet<AcceleratorId>>>;

/// Clears a device's in-flight mark when the blocking read finishes
struct InFlightGuard {
    in_flight: InFlight,
    id: AcceleratorId,
}

impl InFlightGuard {
    /// `None` if a read of `id` is already outstanding
    fn acquire(in_flight: &InFlight, id: AcceleratorId) -> Option<Self> {
        in_flight.lock().insert(id).then(|| Self {
            in_flight: Arc::clone(in_flight),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

/// Periodic sampler feeding an [`AcceleratorRegistry`]
pub struct TelemetrySampler {
    registry: Arc<AcceleratorRegistry>,
    probe: Arc<dyn HardwareProbe>,
    config: TelemetryConfig,
    in_flight: InFlight,
}

impl TelemetrySampler {
    pub fn new(
        registry: Arc<AcceleratorRegistry>,
        probe: Arc<dyn HardwareProbe>,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            in_flight: Arc::default(),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Number of devices whose previous read has not returned yet
    pub fn outstanding_reads(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Read every device once and publish the result as a new snapshot
    pub async fn sample_all(&self) -> SamplingReport {
        let current = self.registry.snapshot();
        if current.is_empty() {
            return SamplingReport::default();
        }

        let timeout = self.config.query_timeout();
        let reads = current.iter().map(|state| {
            let probe = Arc::clone(&self.probe);
            let id = state.id;
            let guard = InFlightGuard::acquire(&self.in_flight, id);
            async move {
                let Some(guard) = guard else {
                    return (id, Err(ProbeError::Busy));
                };
                let reading = probe::run_blocking(timeout, move || {
                    let _guard = guard;
                    probe.read(id)
                })
                .await;
                (id, reading)
            }
        });
        let readings = join_all(reads).await;

        let now = Instant::now();
        let mut report = SamplingReport::default();
        let mut next = Vec::with_capacity(current.len());

        for (state, (id, reading)) in current.iter().zip(readings) {
            match reading {
                Ok(reading) => {
                    if state.stale && current.generation() > 0 {
                        info!(accelerator = %id, "telemetry recovered");
                    }
                    next.push(state.with_reading(&reading, now));
                    report.sampled.push(id);
                }
                Err(e) => {
                    let err = ControlError::HardwareQueryFailed {
                        device: id.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(
                        accelerator = %id,
                        age_ms = state.telemetry_age(now).as_millis() as u64,
                        error = %err,
                        "keeping last-known telemetry"
                    );
                    next.push(state.marked_stale());
                    report.stale.push(id);
                }
            }
        }

        self.registry.publish(next);
        debug!(
            sampled = report.sampled.len(),
            stale = report.stale.len(),
            "telemetry pass complete"
        );
        report
    }

    /// Run [`sample_all`](Self::sample_all) every sampling interval until
    /// `token` is cancelled
    ///
    /// The first tick is skipped: the caller is expected to have run a pass
    /// already. Cancellation is observed between and during passes.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sampling_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = self.sample_all() => {}
                        }
                    }
                }
            }
            debug!("telemetry sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{DeviceReading, MockProbe};

    const MIB: u64 = 1024 * 1024;

    async fn setup(config: TelemetryConfig) -> (Arc<MockProbe>, Arc<AcceleratorRegistry>, Arc<TelemetrySampler>) {
        let probe = Arc::new(MockProbe::simulated());
        let registry = Arc::new(
            AcceleratorRegistry::discover(probe.clone(), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let sampler = Arc::new(TelemetrySampler::new(
            Arc::clone(&registry),
            probe.clone(),
            config,
        ));
        (probe, registry, sampler)
    }

    #[tokio::test]
    async fn test_sample_all_publishes_readings() {
        let (_probe, registry, sampler) = setup(TelemetryConfig::default()).await;

        let report = sampler.sample_all().await;
        assert!(report.is_complete());
        assert_eq!(report.sampled, vec![AcceleratorId(0), AcceleratorId(1)]);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.generation(), 1);
        let gpu0 = snapshot.get(AcceleratorId(0)).unwrap();
        assert_eq!(gpu0.free_memory_bytes, 10240 * MIB);
        assert!(!gpu0.stale);
    }

    #[tokio::test]
    async fn test_failed_device_keeps_last_known_values() {
        let (probe, registry, sampler) = setup(TelemetryConfig::default()).await;
        sampler.sample_all().await;
        let first = registry.snapshot().get(AcceleratorId(1)).unwrap().clone();

        probe.set_failing(AcceleratorId(1), true);
        probe.set_reading(AcceleratorId(0), DeviceReading::new(MIB, 80.0, 70.0, 100.0));
        let report = sampler.sample_all().await;

        assert_eq!(report.sampled, vec![AcceleratorId(0)]);
        assert_eq!(report.stale, vec![AcceleratorId(1)]);

        let snapshot = registry.snapshot();
        let gpu1 = snapshot.get(AcceleratorId(1)).unwrap();
        assert!(gpu1.stale);
        assert_eq!(gpu1.free_memory_bytes, first.free_memory_bytes);
        assert_eq!(gpu1.last_sampled_at, first.last_sampled_at);
        assert_eq!(snapshot.get(AcceleratorId(0)).unwrap().utilization_percent, 80.0);
    }

    #[tokio::test]
    async fn test_hung_probe_is_bounded_by_query_timeout() {
        let config = TelemetryConfig {
            query_timeout_ms: 20,
            ..Default::default()
        };
        let (probe, registry, sampler) = setup(config).await;
        probe.set_delay(Some(Duration::from_millis(200)));

        let started = std::time::Instant::now();
        let report = sampler.sample_all().await;
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(report.stale.len(), 2);
        assert!(registry.snapshot().iter().all(|s| s.stale));
    }

    #[tokio::test]
    async fn test_hung_read_is_not_reissued() {
        let probe = Arc::new(MockProbe::new().with_device(
            "Test GPU",
            8192 * MIB,
            DeviceReading::new(4096 * MIB, 10.0, 40.0, 50.0),
        ));
        let registry = Arc::new(
            AcceleratorRegistry::discover(probe.clone(), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let config = TelemetryConfig {
            sampling_interval_ms: 20,
            query_timeout_ms: 10,
            ..Default::default()
        };
        let sampler = Arc::new(TelemetrySampler::new(
            Arc::clone(&registry),
            probe.clone(),
            config,
        ));

        probe.set_delay(Some(Duration::from_millis(300)));
        let token = CancellationToken::new();
        let handle = Arc::clone(&sampler).spawn(token.clone());
        sampler.sample_all().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(probe.peak_concurrent_reads(), 1);
        assert_eq!(probe.read_count(), 1);
        assert_eq!(sampler.outstanding_reads(), 1);
        assert!(registry.snapshot().iter().all(|s| s.stale));
        assert!(registry.snapshot().generation() >= 5);

        // Once the hung read returns, the device is read again
        probe.set_delay(None);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sampler.outstanding_reads(), 0);
        assert!(registry.snapshot().iter().all(|s| !s.stale));
        assert_eq!(probe.peak_concurrent_reads(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_background_loop_ticks_and_stops_on_cancel() {
        let config = TelemetryConfig {
            sampling_interval_ms: 10,
            ..Default::default()
        };
        let (_probe, registry, sampler) = setup(config).await;
        let token = CancellationToken::new();
        let handle = Arc::clone(&sampler).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.snapshot().generation() >= 2);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
