//! Ezio agent entry point
//!
//! Loads configuration, starts the control plane, places the configured
//! experts and logs a health report every poll interval until Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `EZIO_CONFIG` | Configuration file, same as `--config`. |
//! | `EZIO_<SECTION>__<KEY>` | Overrides one key, e.g. `EZIO_CACHE__CAPACITY=64`. |
//! | `RUST_LOG` | Log filter; takes precedence over `logging.filter`. |

mod cli;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use ezio_foundation::{
    ControlPlane, ControlPlaneConfig, HardwareProbe, HealthStatus, LogFormat, LoggingConfig,
    MockProbe, NvidiaSmiProbe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_str().context("configuration path is not valid UTF-8")?;
            ControlPlaneConfig::load(path)
                .with_context(|| format!("loading configuration from {path}"))?
        }
        None => ControlPlaneConfig::from_env().context("reading EZIO_* configuration")?,
    };

    init_tracing(&config.logging, cli.verbose)?;

    let probe: Arc<dyn HardwareProbe> = if cli.mock_hardware {
        info!("using simulated hardware");
        Arc::new(MockProbe::simulated())
    } else {
        if !NvidiaSmiProbe::driver_present() {
            warn!("no NVIDIA device nodes found, discovery will likely report zero accelerators");
        }
        Arc::new(NvidiaSmiProbe::new().with_timeout(config.telemetry.query_timeout()))
    };

    let plane = ControlPlane::start(config, probe)
        .await
        .context("starting control plane")?;

    let placements = plane.load_experts();
    let placed = placements.iter().filter(|p| p.result.is_ok()).count();
    if !placements.is_empty() {
        info!(placed, total = placements.len(), "experts loaded");
    }

    if cli.once {
        let report = plane.health_report().await;
        println!("{}", serde_json::to_string_pretty(report.as_ref())?);
        plane.shutdown().await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(plane.config().health.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The monitor polls immediately; report after its first interval
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                housekeeping(&plane);
                if let Some(report) = plane.health().latest() {
                    let json = serde_json::to_string(report.as_ref())?;
                    match report.status {
                        HealthStatus::Healthy => info!(report = %json, "health"),
                        _ => warn!(report = %json, "health"),
                    }
                }
            }
        }
    }

    plane.shutdown().await;
    Ok(())
}

fn housekeeping(plane: &ControlPlane) {
    let expired = plane.cache().purge_expired();
    let idle = plane.rate_limiter().cleanup();
    let stats = plane.cache().stats();
    tracing::debug!(
        expired,
        idle_rate_buckets = idle,
        cache_size = stats.size,
        cache_hit_rate = stats.hit_rate(),
        allocations = plane.allocations().len(),
        "housekeeping"
    );
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("ezio=debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.filter))
            .context("invalid logging.filter")?
    };

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}
