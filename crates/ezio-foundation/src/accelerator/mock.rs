//! Scriptable in-memory probe
//!
//! Used by tests and by `ezio-agent --mock-hardware`. Readings can be
//! replaced, devices can be made to fail, and every call can be delayed to
//! simulate a hung driver.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::probe::{DeviceDescriptor, DeviceReading, HardwareProbe, ProbeError};
use super::AcceleratorId;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<AcceleratorId, (DeviceDescriptor, DeviceReading)>,
    failing: HashSet<AcceleratorId>,
    fail_enumerate: bool,
    delay: Option<Duration>,
    reads: u64,
    active_reads: usize,
    peak_reads: usize,
}

/// In-memory [`HardwareProbe`]
#[derive(Debug, Default)]
pub struct MockProbe {
    state: Mutex<MockState>,
}

impl MockProbe {
    /// Probe with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Two consumer cards: a 12 GB RTX 3060 and a 6 GB RTX 2060
    pub fn simulated() -> Self {
        Self::new()
            .with_device(
                "NVIDIA GeForce RTX 3060",
                12288 * MIB,
                DeviceReading::new(10240 * MIB, 15.0, 45.0, 35.0),
            )
            .with_device(
                "NVIDIA GeForce RTX 2060",
                6144 * MIB,
                DeviceReading::new(5632 * MIB, 5.0, 40.0, 20.0),
            )
    }

    /// Add a device; ids are assigned in insertion order starting at 0
    pub fn with_device(self, name: &str, total_memory_bytes: u64, reading: DeviceReading) -> Self {
        {
            let mut state = self.state.lock();
            let id = AcceleratorId(state.devices.len() as u32);
            let descriptor = DeviceDescriptor {
                id,
                name: name.to_string(),
                total_memory_bytes,
            };
            state.devices.insert(id, (descriptor, reading));
        }
        self
    }

    /// Replace the reading returned for `id`
    pub fn set_reading(&self, id: AcceleratorId, reading: DeviceReading) {
        if let Some((_, current)) = self.state.lock().devices.get_mut(&id) {
            *current = reading;
        }
    }

    /// Make reads of `id` fail (or succeed again)
    pub fn set_failing(&self, id: AcceleratorId, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(id);
        } else {
            state.failing.remove(&id);
        }
    }

    pub fn set_enumerate_failing(&self, failing: bool) {
        self.state.lock().fail_enumerate = failing;
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Number of `read` calls served so far, failed ones included
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// Most `read` calls that were ever running at the same time
    pub fn peak_concurrent_reads(&self) -> usize {
        self.state.lock().peak_reads
    }

    fn pause(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl HardwareProbe for MockProbe {
    fn name(&self) -> &str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, ProbeError> {
        self.pause();
        let state = self.state.lock();
        if state.fail_enumerate {
            return Err(ProbeError::Unavailable("mock enumeration disabled".into()));
        }
        Ok(state
            .devices
            .values()
            .map(|(descriptor, _)| descriptor.clone())
            .collect())
    }

    fn read(&self, id: AcceleratorId) -> Result<DeviceReading, ProbeError> {
        {
            let mut state = self.state.lock();
            state.active_reads += 1;
            state.peak_reads = state.peak_reads.max(state.active_reads);
        }
        self.pause();
        let mut state = self.state.lock();
        state.active_reads -= 1;
        state.reads += 1;
        if state.failing.contains(&id) {
            return Err(ProbeError::Query(format!("injected failure on {id}")));
        }
        state
            .devices
            .get(&id)
            .map(|(_, reading)| reading.clone())
            .ok_or(ProbeError::DeviceNotFound(id))
    }
}
