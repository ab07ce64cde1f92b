//! Periodic health polling

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthAggregator, HealthReport, HealthStatus};

const HISTORY_LEN: usize = 100;

/// Polls a [`HealthAggregator`] and keeps recent reports
pub struct HealthMonitor {
    aggregator: Arc<HealthAggregator>,
    latest: RwLock<Option<Arc<HealthReport>>>,
    history: Mutex<VecDeque<Arc<HealthReport>>>,
}

impl HealthMonitor {
    pub fn new(aggregator: Arc<HealthAggregator>) -> Self {
        Self {
            aggregator,
            latest: RwLock::new(None),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    pub fn aggregator(&self) -> &Arc<HealthAggregator> {
        &self.aggregator
    }

    /// Run every check once and record the report
    pub async fn poll_once(&self) -> Arc<HealthReport> {
        let report = Arc::new(self.aggregator.run_all().await);

        let previous = self.latest.read().as_ref().map(|r| r.status);
        if previous != Some(report.status) {
            match report.status {
                HealthStatus::Healthy => info!(status = %report.status, "health status changed"),
                _ => warn!(
                    status = %report.status,
                    previous = ?previous,
                    "health status changed"
                ),
            }
        }

        *self.latest.write() = Some(Arc::clone(&report));
        let mut history = self.history.lock();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(Arc::clone(&report));
        report
    }

    /// Most recent report, if any poll has completed
    pub fn latest(&self) -> Option<Arc<HealthReport>> {
        self.latest.read().clone()
    }

    /// Recorded reports, oldest first
    pub fn history(&self) -> Vec<Arc<HealthReport>> {
        self.history.lock().iter().cloned().collect()
    }

    /// Poll every `interval` until `token` is cancelled; the first poll runs
    /// immediately
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = self.poll_once() => {}
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }
}
