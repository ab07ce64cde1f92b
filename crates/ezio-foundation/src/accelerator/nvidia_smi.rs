//! NVIDIA probe backed by `nvidia-smi`
//!
//! Shells out instead of linking NVML so the crate builds on machines
//! without the driver. Each call is one process spawn, which is acceptable
//! at a sampling period of seconds. A child that outlives the query
//! timeout is killed, so a wedged driver never accumulates processes.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use super::probe::{DeviceDescriptor, DeviceReading, HardwareProbe, ProbeError};
use super::AcceleratorId;

const QUERY_FIELDS: &str =
    "index,name,memory.total,memory.free,utilization.gpu,temperature.gpu,power.draw";

const MIB: u64 = 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Probe that queries NVIDIA GPUs through the `nvidia-smi` CLI
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl NvidiaSmiProbe {
    /// Use `nvidia-smi` from `PATH`
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Kill `nvidia-smi` if it has not exited after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cheap check for the kernel module's device node
    pub fn driver_present() -> bool {
        Path::new("/dev/nvidia0").exists() || Path::new("/dev/nvidiactl").exists()
    }

    fn query(&self, id: Option<AcceleratorId>) -> Result<Vec<(DeviceDescriptor, DeviceReading)>, ProbeError> {
        let mut command = Command::new(&self.binary);
        command
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits");
        if let Some(id) = id {
            command.arg(format!("--id={}", id.0));
        }

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProbeError::Unavailable(format!("{}: {e}", self.binary.display())))?;

        let status = wait_or_kill(&mut child, self.timeout)?;

        // Query output is a few lines, well under the pipe buffer
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)
                .map_err(|e| ProbeError::Query(e.to_string()))?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        if !status.success() {
            return Err(ProbeError::Query(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                status,
                stderr.trim()
            )));
        }

        parse_query_output(&stdout)
    }
}

/// Wait for `child` to exit, killing and reaping it once `timeout` passes
fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<ExitStatus, ProbeError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::Timeout(timeout));
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(ProbeError::Query(e.to_string())),
        }
    }
}

impl HardwareProbe for NvidiaSmiProbe {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, ProbeError> {
        Ok(self
            .query(None)?
            .into_iter()
            .map(|(descriptor, _)| descriptor)
            .collect())
    }

    fn read(&self, id: AcceleratorId) -> Result<DeviceReading, ProbeError> {
        self.query(Some(id))?
            .into_iter()
            .find(|(descriptor, _)| descriptor.id == id)
            .map(|(_, reading)| reading)
            .ok_or(ProbeError::DeviceNotFound(id))
    }
}

/// Parse `nvidia-smi --query-gpu=<QUERY_FIELDS> --format=csv,noheader,nounits`
///
/// Memory arrives in MiB and is converted to bytes. Fields the driver does
/// not support (`[N/A]`, `[Not Supported]`) read as zero.
pub fn parse_query_output(
    stdout: &str,
) -> Result<Vec<(DeviceDescriptor, DeviceReading)>, ProbeError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<(DeviceDescriptor, DeviceReading), ProbeError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [index, name, total, free, utilization, temperature, power] = fields.as_slice() else {
        return Err(ProbeError::Parse(format!(
            "expected 7 fields, got {}: {line}",
            fields.len()
        )));
    };

    let index: u32 = index
        .parse()
        .map_err(|_| ProbeError::Parse(format!("bad device index '{index}'")))?;
    let total_mib = number(total, "memory.total")?.unwrap_or(0.0);
    let free_mib = number(free, "memory.free")?.unwrap_or(0.0);

    let descriptor = DeviceDescriptor {
        id: AcceleratorId(index),
        name: name.to_string(),
        total_memory_bytes: total_mib as u64 * MIB,
    };
    let reading = DeviceReading {
        free_memory_bytes: free_mib as u64 * MIB,
        utilization_percent: number(utilization, "utilization.gpu")?.unwrap_or(0.0) as f32,
        temperature_celsius: number(temperature, "temperature.gpu")?.unwrap_or(0.0) as f32,
        power_watts: number(power, "power.draw")?.unwrap_or(0.0) as f32,
    };
    Ok((descriptor, reading))
}

fn number(field: &str, what: &str) -> Result<Option<f64>, ProbeError> {
    if field.starts_with('[') || field.eq_ignore_ascii_case("n/a") {
        return Ok(None);
    }
    field
        .parse::<f64>()
        .map(Some)
        .map_err(|_| ProbeError::Parse(format!("bad {what} value '{field}'")))
}
