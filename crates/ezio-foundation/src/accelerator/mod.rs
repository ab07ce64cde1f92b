//! Accelerator registry
//!
//! The registry owns the live view of every discovered accelerator. The
//! telemetry sampler is its only writer: each pass builds a complete new
//! [`TelemetrySnapshot`] and publishes it by swapping one `Arc`. Readers
//! clone that `Arc`, so they always see either the previous or the new
//! snapshot in full and never hold a lock while deciding anything.

pub mod mock;
pub mod nvidia_smi;
pub mod probe;
pub mod sampler;

pub use mock::MockProbe;
pub use nvidia_smi::NvidiaSmiProbe;
pub use probe::{DeviceDescriptor, DeviceReading, HardwareProbe, ProbeError};
pub use sampler::{SamplingReport, TelemetryConfig, TelemetrySampler};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};

/// Stable handle of a physical accelerator (its driver index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AcceleratorId(pub u32);

impl std::fmt::Display for AcceleratorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// Live state of one accelerator as of its last sample
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorState {
    pub id: AcceleratorId,
    pub name: String,
    pub total_memory_bytes: u64,
    /// Always `<= total_memory_bytes`
    pub free_memory_bytes: u64,
    /// In `[0, 100]`
    pub utilization_percent: f32,
    pub temperature_celsius: f32,
    pub power_watts: f32,
    /// When the hardware last answered for this device
    pub last_sampled_at: Instant,
    /// The most recent query for this device failed; values are last-known
    pub stale: bool,
}

impl AcceleratorState {
    /// Record for a freshly discovered device that has not been sampled yet
    pub(crate) fn unsampled(descriptor: &DeviceDescriptor, at: Instant) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            total_memory_bytes: descriptor.total_memory_bytes,
            free_memory_bytes: 0,
            utilization_percent: 0.0,
            temperature_celsius: 0.0,
            power_watts: 0.0,
            last_sampled_at: at,
            stale: true,
        }
    }

    /// New record carrying `reading`; static fields are kept from `self`
    pub(crate) fn with_reading(&self, reading: &DeviceReading, at: Instant) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            total_memory_bytes: self.total_memory_bytes,
            free_memory_bytes: reading.free_memory_bytes.min(self.total_memory_bytes),
            utilization_percent: reading.utilization_percent.clamp(0.0, 100.0),
            temperature_celsius: reading.temperature_celsius,
            power_watts: reading.power_watts.max(0.0),
            last_sampled_at: at,
            stale: false,
        }
    }

    /// Same values, flagged stale; `last_sampled_at` keeps ageing
    pub(crate) fn marked_stale(&self) -> Self {
        Self {
            stale: true,
            ..self.clone()
        }
    }

    pub fn used_memory_bytes(&self) -> u64 {
        self.total_memory_bytes - self.free_memory_bytes
    }

    /// Time since the hardware last answered for this device
    pub fn telemetry_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_sampled_at)
    }
}

/// An immutable, internally consistent view of every accelerator
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    accelerators: Vec<AcceleratorState>,
    generation: u64,
}

impl TelemetrySnapshot {
    fn new(mut accelerators: Vec<AcceleratorState>, generation: u64) -> Self {
        accelerators.sort_by_key(|state| state.id);
        Self {
            accelerators,
            generation,
        }
    }

    pub fn get(&self, id: AcceleratorId) -> Option<&AcceleratorState> {
        self.accelerators.iter().find(|state| state.id == id)
    }

    /// States ordered by accelerator id
    pub fn iter(&self) -> impl Iterator<Item = &AcceleratorState> {
        self.accelerators.iter()
    }

    pub fn len(&self) -> usize {
        self.accelerators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accelerators.is_empty()
    }

    /// Number of publishes that preceded this snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Registry of discovered accelerators and their published telemetry
#[derive(Debug)]
pub struct AcceleratorRegistry {
    devices: Vec<DeviceDescriptor>,
    current: RwLock<Arc<TelemetrySnapshot>>,
}

impl AcceleratorRegistry {
    /// Enumerate devices once through `probe`
    ///
    /// Fails with [`ControlError::NoAcceleratorsFound`] when the probe reports
    /// zero devices or cannot enumerate at all. Callers are expected to fall
    /// back to [`AcceleratorRegistry::empty`] and keep running.
    pub async fn discover(
        probe: Arc<dyn HardwareProbe>,
        timeout: Duration,
    ) -> ControlResult<Self> {
        let name = probe.name().to_string();
        let devices = match probe::run_blocking(timeout, move || probe.enumerate()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(probe = %name, error = %e, "accelerator enumeration failed");
                return Err(ControlError::NoAcceleratorsFound);
            }
        };

        if devices.is_empty() {
            warn!(probe = %name, "probe reported zero accelerators");
            return Err(ControlError::NoAcceleratorsFound);
        }

        for device in &devices {
            info!(
                accelerator = %device.id,
                name = %device.name,
                total_memory_mb = device.total_memory_bytes / (1024 * 1024),
                "accelerator discovered"
            );
        }

        Ok(Self::from_descriptors(devices))
    }

    /// Registry with no devices, used when discovery failed
    pub fn empty() -> Self {
        Self::from_descriptors(Vec::new())
    }

    pub(crate) fn from_descriptors(devices: Vec<DeviceDescriptor>) -> Self {
        let now = Instant::now();
        let states = devices
            .iter()
            .map(|device| AcceleratorState::unsampled(device, now))
            .collect();
        Self {
            devices,
            current: RwLock::new(Arc::new(TelemetrySnapshot::new(states, 0))),
        }
    }

    /// Current snapshot; cheap, never waits on the sampler's hardware calls
    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&*self.current.read())
    }

    pub fn descriptors(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Replace the published snapshot. Only the sampler calls this.
    pub(crate) fn publish(&self, states: Vec<AcceleratorState>) {
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(TelemetrySnapshot::new(states, generation));
    }
}
