//! Control plane wiring
//!
//! [`ControlPlane`] is constructed once and handed to every consumer. It
//! owns the background tasks (telemetry sampler, health monitor) and the
//! cancellation token that stops them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accelerator::{AcceleratorId, AcceleratorRegistry, HardwareProbe, TelemetrySampler};
use crate::allocation::AllocationManager;
use crate::cache::Cache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::ControlPlaneConfig;
use crate::error::{ControlError, ControlResult};
use crate::expert::{Capability, Expert, ExpertRegistry};
use crate::health::{
    AcceleratorHealthCheck, CircuitHealthCheck, HealthAggregator, HealthMonitor, HealthReport,
    SystemMemoryCheck,
};
use crate::rate_limiter::RateLimiter;

/// Cache of computed results shared by the agent
pub type ResultCache = Cache<String, serde_json::Value>;

/// Outcome of placing one configured expert
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertPlacement {
    pub name: String,
    pub capability: Capability,
    pub result: ControlResult<AcceleratorId>,
}

/// The resource-and-resilience control plane
pub struct ControlPlane {
    config: ControlPlaneConfig,
    accelerators: Arc<AcceleratorRegistry>,
    allocations: AllocationManager,
    sampler: Arc<TelemetrySampler>,
    cache: ResultCache,
    circuits: Arc<CircuitBreakerRegistry>,
    rate_limiter: RateLimiter,
    health: Arc<HealthMonitor>,
    expert_kinds: ExpertRegistry,
    experts: Mutex<HashMap<String, Arc<dyn Expert>>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ControlPlane {
    /// Start with the built-in expert kinds
    pub async fn start(
        config: ControlPlaneConfig,
        probe: Arc<dyn HardwareProbe>,
    ) -> ControlResult<Self> {
        Self::start_with_experts(config, probe, ExpertRegistry::with_builtin()).await
    }

    /// Validate `config`, discover accelerators and spawn background tasks
    ///
    /// Finding no accelerators is not an error: the plane starts degraded and
    /// every allocation fails with [`ControlError::NoAcceleratorsFound`].
    pub async fn start_with_experts(
        config: ControlPlaneConfig,
        probe: Arc<dyn HardwareProbe>,
        expert_kinds: ExpertRegistry,
    ) -> ControlResult<Self> {
        config.validate()?;

        let timeout = config.telemetry.query_timeout();
        let accelerators = match AcceleratorRegistry::discover(Arc::clone(&probe), timeout).await {
            Ok(registry) => Arc::new(registry),
            Err(ControlError::NoAcceleratorsFound) => {
                warn!("no accelerators found, allocation disabled");
                Arc::new(AcceleratorRegistry::empty())
            }
            Err(e) => return Err(e),
        };

        let sampler = Arc::new(TelemetrySampler::new(
            Arc::clone(&accelerators),
            probe,
            config.telemetry.clone(),
        ));
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        if !accelerators.is_empty() {
            // Allocation needs live readings before the first tick
            sampler.sample_all().await;
            tasks.push(Arc::clone(&sampler).spawn(token.child_token()));
        }

        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));

        let aggregator = Arc::new(HealthAggregator::new(config.health.check_timeout()));
        aggregator.register(Arc::new(AcceleratorHealthCheck::new(
            Arc::clone(&accelerators),
            config.health.temperature_threshold_celsius,
            config.health.staleness_threshold(),
        )));
        aggregator.register(Arc::new(CircuitHealthCheck::new(Arc::clone(&circuits))));
        aggregator.register(Arc::new(SystemMemoryCheck::new(
            config.health.memory_threshold_percent,
        )));
        let health = Arc::new(HealthMonitor::new(aggregator));
        tasks.push(Arc::clone(&health).spawn(config.health.poll_interval(), token.child_token()));

        info!(
            accelerators = accelerators.descriptors().len(),
            sampling_interval_ms = config.telemetry.sampling_interval_ms,
            cache_capacity = config.cache.capacity,
            "control plane started"
        );

        Ok(Self {
            allocations: AllocationManager::new(Arc::clone(&accelerators)),
            cache: Cache::new(&config.cache),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            accelerators,
            sampler,
            circuits,
            health,
            expert_kinds,
            experts: Mutex::new(HashMap::new()),
            token,
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn accelerators(&self) -> &Arc<AcceleratorRegistry> {
        &self.accelerators
    }

    pub fn allocations(&self) -> &AllocationManager {
        &self.allocations
    }

    pub fn sampler(&self) -> &Arc<TelemetrySampler> {
        &self.sampler
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// `true` when discovery found no accelerators
    pub fn is_degraded(&self) -> bool {
        self.accelerators.is_empty()
    }

    pub fn allocate(&self, workload_name: &str, required_memory_bytes: u64) -> ControlResult<AcceleratorId> {
        self.allocations.allocate(workload_name, required_memory_bytes)
    }

    pub fn release(&self, workload_name: &str) {
        self.allocations.release(workload_name);
    }

    /// Run every health check now
    pub async fn health_report(&self) -> Arc<HealthReport> {
        self.health.poll_once().await
    }

    /// Build every configured expert and reserve accelerator memory for it
    ///
    /// Failures are reported per expert and logged; they never abort the
    /// others.
    pub fn load_experts(&self) -> Vec<ExpertPlacement> {
        let mut placements = Vec::with_capacity(self.config.experts.len());

        for spec in &self.config.experts {
            let expert: Arc<dyn Expert> = match self.expert_kinds.build(spec) {
                Ok(expert) => Arc::from(expert),
                Err(e) => {
                    warn!(expert = %spec.name, error = %e, "expert not built");
                    placements.push(ExpertPlacement {
                        name: spec.name.clone(),
                        capability: spec.capability,
                        result: Err(e),
                    });
                    continue;
                }
            };

            let result = self.allocate(expert.name(), expert.required_memory_bytes());
            match &result {
                Ok(id) => {
                    info!(
                        expert = %expert.name(),
                        capability = %expert.capability(),
                        accelerator = %id,
                        "expert ready"
                    );
                    self.experts
                        .lock()
                        .insert(expert.name().to_string(), Arc::clone(&expert));
                }
                Err(e) => warn!(expert = %expert.name(), error = %e, "expert not placed"),
            }
            placements.push(ExpertPlacement {
                name: expert.name().to_string(),
                capability: expert.capability(),
                result,
            });
        }
        placements
    }

    pub fn expert(&self, name: &str) -> Option<Arc<dyn Expert>> {
        self.experts.lock().get(name).cloned()
    }

    /// Placed experts offering `capability`, sorted by name
    pub fn experts_with(&self, capability: Capability) -> Vec<Arc<dyn Expert>> {
        let mut matching: Vec<_> = self
            .experts
            .lock()
            .values()
            .filter(|e| e.capability() == capability)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name().cmp(b.name()));
        matching
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop background tasks and release every allocation
    ///
    /// Safe to call more than once. Tasks that do not finish within the
    /// shutdown grace period are aborted.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let deadline = tokio::time::Instant::now() + self.config.telemetry.shutdown_grace();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                task.abort();
            }
        }

        let released = self.allocations.release_all();
        self.experts.lock().clear();
        info!(released, "control plane shut down");
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
