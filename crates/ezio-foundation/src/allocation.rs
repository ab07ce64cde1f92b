//! Workload placement
//!
//! Placement reads one published telemetry snapshot and never locks out the
//! sampler. Decisions are serialized by the allocation table's mutex so two
//! concurrent requests cannot both count the same headroom.
//!
//! Reservations are advisory: they do not lower the sampled free memory,
//! which keeps coming from the hardware. They are checked against each
//! device's total capacity instead, so the sum of reservations on one device
//! can never exceed it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::accelerator::{AcceleratorId, AcceleratorRegistry, AcceleratorState};
use crate::error::{ControlError, ControlResult};

/// An active placement of a workload on an accelerator
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub workload_name: String,
    pub accelerator_id: AcceleratorId,
    pub accelerator_name: String,
    pub reserved_memory_bytes: u64,
    pub created_at: Instant,
}

/// Maps workload names to accelerators
pub struct AllocationManager {
    registry: Arc<AcceleratorRegistry>,
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl AllocationManager {
    pub fn new(registry: Arc<AcceleratorRegistry>) -> Self {
        Self {
            registry,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Place `workload_name` on the least utilized accelerator that can hold
    /// `required_memory_bytes`
    ///
    /// Idempotent: a workload that is already placed gets its existing
    /// accelerator back and no second record is created. Ties on utilization
    /// go to the lowest accelerator id.
    pub fn allocate(
        &self,
        workload_name: &str,
        required_memory_bytes: u64,
    ) -> ControlResult<AcceleratorId> {
        let mut allocations = self.allocations.lock();

        if let Some(existing) = allocations.get(workload_name) {
            debug!(
                workload = %workload_name,
                accelerator = %existing.accelerator_id,
                "workload already allocated"
            );
            return Ok(existing.accelerator_id);
        }

        if self.registry.is_empty() {
            return Err(ControlError::NoAcceleratorsFound);
        }

        let snapshot = self.registry.snapshot();
        let chosen = snapshot
            .iter()
            .filter(|state| {
                let reserved = reserved_on(&allocations, state.id);
                fits(state, reserved, required_memory_bytes)
            })
            .min_by(|a, b| {
                a.utilization_percent
                    .total_cmp(&b.utilization_percent)
                    .then(a.id.cmp(&b.id))
            })
            .ok_or_else(|| ControlError::InsufficientCapacity {
                workload: workload_name.to_string(),
                required_bytes: required_memory_bytes,
            })?;

        let allocation = Allocation {
            workload_name: workload_name.to_string(),
            accelerator_id: chosen.id,
            accelerator_name: chosen.name.clone(),
            reserved_memory_bytes: required_memory_bytes,
            created_at: Instant::now(),
        };
        info!(
            workload = %workload_name,
            accelerator = %chosen.id,
            name = %chosen.name,
            required_mb = required_memory_bytes / (1024 * 1024),
            utilization = chosen.utilization_percent,
            stale = chosen.stale,
            "workload allocated"
        );
        allocations.insert(workload_name.to_string(), allocation);
        Ok(chosen.id)
    }

    /// Drop the allocation for `workload_name`; absent workloads are ignored
    pub fn release(&self, workload_name: &str) -> Option<Allocation> {
        let released = self.allocations.lock().remove(workload_name);
        if let Some(allocation) = &released {
            info!(
                workload = %workload_name,
                accelerator = %allocation.accelerator_id,
                "workload released"
            );
        }
        released
    }

    /// Drop every allocation, returning how many there were
    pub fn release_all(&self) -> usize {
        let mut allocations = self.allocations.lock();
        let count = allocations.len();
        allocations.clear();
        count
    }

    pub fn get(&self, workload_name: &str) -> Option<Allocation> {
        self.allocations.lock().get(workload_name).cloned()
    }

    /// Active allocations ordered by workload name
    pub fn allocations(&self) -> Vec<Allocation> {
        let mut all: Vec<_> = self.allocations.lock().values().cloned().collect();
        all.sort_by(|a, b| a.workload_name.cmp(&b.workload_name));
        all
    }

    /// Bytes reserved on `id` by active allocations
    pub fn reserved_on(&self, id: AcceleratorId) -> u64 {
        reserved_on(&self.allocations.lock(), id)
    }

    pub fn len(&self) -> usize {
        self.allocations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.lock().is_empty()
    }
}

fn reserved_on(allocations: &HashMap<String, Allocation>, id: AcceleratorId) -> u64 {
    allocations
        .values()
        .filter(|a| a.accelerator_id == id)
        .map(|a| a.reserved_memory_bytes)
        .sum()
}

fn fits(state: &AcceleratorState, reserved: u64, required: u64) -> bool {
    state.free_memory_bytes >= required
        && reserved
            .checked_add(required)
            .is_some_and(|total| total <= state.total_memory_bytes)
}
