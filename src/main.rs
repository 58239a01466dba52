// src/main.rs
//! Taskflow Engine
//!
//! Runs the task execution service until SIGINT or SIGTERM. SIGHUP restarts
//! the engine with the configuration file re-read from disk; a second stop
//! signal during a graceful shutdown forces it.

use anyhow::{Context, Result};
use std::sync::Arc;
use taskflow_engine::lifecycle::{RestartManager, Service, ShutdownManager};
use taskflow_engine::observability::{init_metrics, init_tracing};
use taskflow_engine::utils::config::EngineConfig;
use taskflow_engine::BuildInfo;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = EngineConfig::resolve_path();
    let config = EngineConfig::load_from(config_path.as_deref())
        .context("failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    init_metrics(config.monitoring.metrics_addr.as_deref())?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        rustc = build.rustc_version,
        config = ?config_path,
        "Starting taskflow engine"
    );

    let service = Arc::new(Service::new(config, config_path).context("failed to build service")?);
    service.start().context("failed to start service")?;

    let restart = Arc::new(RestartManager::new(Arc::clone(&service)));
    let shutdown = Arc::new(ShutdownManager::new(Arc::clone(&service)));
    restart.start()?;
    shutdown.start()?;

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, restarting");
                let restart = Arc::clone(&restart);
                match tokio::task::spawn_blocking(move || restart.restart()).await? {
                    Ok(outcome) => info!(
                        attempts = outcome.attempts,
                        config_reloaded = outcome.config_reloaded,
                        "Engine restarted"
                    ),
                    Err(e) => error!("Restart failed: {}", e),
                }
            }
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
        }
    }

    info!("Received shutdown signal, cleaning up...");
    restart.stop()?;

    let mut graceful = {
        let shutdown = Arc::clone(&shutdown);
        tokio::task::spawn_blocking(move || shutdown.shutdown())
    };

    let outcome = tokio::select! {
        outcome = &mut graceful => outcome?,
        _ = async {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        } => {
            warn!("Second signal received, forcing shutdown");
            let forced = Arc::clone(&shutdown);
            if let Err(e) = tokio::task::spawn_blocking(move || forced.force_shutdown()).await? {
                warn!("{}", e);
            }
            graceful.await?
        }
    };

    match outcome {
        Ok(report) if report.is_clean() => info!(elapsed_ms = report.elapsed_ms, "Engine stopped"),
        Ok(report) => {
            for step in report.failed_steps() {
                warn!(step = %step.step, error = ?step.error, "Shutdown step failed");
            }
            info!(elapsed_ms = report.elapsed_ms, "Engine stopped with errors");
        }
        Err(e) => error!("Shutdown failed: {}", e),
    }

    shutdown.stop()?;
    Ok(())
}
