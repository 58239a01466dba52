// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! The library only emits through the `tracing` and `metrics` facades; the
//! binary calls these once at startup to install subscribers and exporters.

use crate::utils::config::{LogFormat, LoggingConfig};
use crate::utils::errors::{EngineError, Result};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Counter: tasks accepted by `submit_task`
pub const TASKS_SUBMITTED: &str = "taskflow_tasks_submitted_total";
/// Counter: tasks that reached `completed`
pub const TASKS_COMPLETED: &str = "taskflow_tasks_completed_total";
/// Counter: tasks that reached `failed`
pub const TASKS_FAILED: &str = "taskflow_tasks_failed_total";
/// Counter: tasks that reached `cancelled`
pub const TASKS_CANCELLED: &str = "taskflow_tasks_cancelled_total";
/// Gauge: tasks by status, labelled `status`
pub const TASKS_BY_STATUS: &str = "taskflow_tasks";
/// Gauge: jobs currently executing in the worker pool
pub const POOL_ACTIVE: &str = "taskflow_pool_active_workers";
/// Gauge: jobs waiting in the worker pool queue
pub const POOL_QUEUED: &str = "taskflow_pool_queue_length";
/// Gauge: processes in the latest process snapshot
pub const PROCESSES_OBSERVED: &str = "taskflow_processes_observed";
/// Histogram: task wall-clock duration in seconds
pub const TASK_DURATION: &str = "taskflow_task_duration_seconds";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::Config(format!("logging.level: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    installed.map_err(|e| EngineError::Config(format!("tracing subscriber: {}", e)))
}

/// Install the Prometheus exporter when a listen address is configured.
///
/// Without an address the `metrics` macros are no-ops.
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::Config(format!("monitoring.metrics_addr '{}': {}", addr, e)))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("prometheus exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_addr() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn test_metrics_rejects_bad_addr() {
        assert!(init_metrics(Some("not-an-address")).is_err());
    }
}
