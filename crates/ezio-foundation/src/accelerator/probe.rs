//! Hardware probe abstraction
//!
//! A probe is the only code that talks to the driver. Its calls may block
//! for an unbounded time, so the control plane never calls it directly:
//! every call goes through [`run_blocking`], which moves it onto the blocking
//! pool and bounds the wait.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::AcceleratorId;

/// Static description of a device, fixed at discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: AcceleratorId,
    pub name: String,
    pub total_memory_bytes: u64,
}

/// One live sample of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub free_memory_bytes: u64,
    pub utilization_percent: f32,
    pub temperature_celsius: f32,
    pub power_watts: f32,
}

impl DeviceReading {
    pub fn new(
        free_memory_bytes: u64,
        utilization_percent: f32,
        temperature_celsius: f32,
        power_watts: f32,
    ) -> Self {
        Self {
            free_memory_bytes,
            utilization_percent,
            temperature_celsius,
            power_watts,
        }
    }
}

/// Probe failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    /// The hardware interface is missing (no driver, no tool)
    #[error("hardware interface unavailable: {0}")]
    Unavailable(String),

    /// The interface answered with an error
    #[error("hardware query failed: {0}")]
    Query(String),

    /// The interface answered with something we could not read
    #[error("unparseable hardware output: {0}")]
    Parse(String),

    #[error("device {0} not found")]
    DeviceNotFound(AcceleratorId),

    #[error("hardware query timed out after {0:?}")]
    Timeout(Duration),

    /// A previous query of the same device has not returned yet
    #[error("previous hardware query still outstanding")]
    Busy,
}

/// Access to the physical accelerators
///
/// Implementations may block; they are always invoked from the blocking pool.
pub trait HardwareProbe: Send + Sync + 'static {
    /// Probe name for logs
    fn name(&self) -> &str;

    /// List every device the interface can see
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, ProbeError>;

    /// Read live metrics for one device
    fn read(&self, id: AcceleratorId) -> Result<DeviceReading, ProbeError>;
}

/// Run a blocking probe call on the blocking pool, giving up after `timeout`
///
/// On timeout the blocking thread is left to finish on its own; the caller
/// gets [`ProbeError::Timeout`] and moves on.
pub(crate) async fn run_blocking<T, F>(timeout: Duration, call: F) -> Result<T, ProbeError>
where
    F: FnOnce() -> Result<T, ProbeError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(ProbeError::Query(format!(
            "probe task aborted: {join_error}"
        ))),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
