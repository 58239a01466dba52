// src/lifecycle/restart.rs
//! Restart orchestration
//!
//! A restart waits up to `shutdown_wait_timeout` for live tasks and cancels
//! the rest, stops components in reverse dependency order, reloads the
//! configuration file, and starts them again with bounded retries. If every
//! attempt fails the engine is left `Degraded` and a later restart may try
//! again.

use crate::lifecycle::service::Service;
use crate::lifecycle::{LifecyclePhase, Sequence};
use crate::runtime::executor::ExecutorStatus;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// State captured before a restart begins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSnapshot {
    pub max_workers: usize,
    pub max_queue: usize,
    pub task_timeout: Duration,
    pub monitor_interval: Duration,
    pub executor_status: ExecutorStatus,
    pub accepting: bool,
    pub live_tasks: usize,
    pub taken_at: DateTime<Utc>,
}

impl RestartSnapshot {
    pub fn capture(service: &Service) -> Self {
        let pool = service.executor().config();
        Self {
            max_workers: pool.max_workers,
            max_queue: pool.max_queue,
            task_timeout: pool.task_timeout,
            monitor_interval: service.tasks().monitor_interval(),
            executor_status: service.get_executor_status(),
            accepting: service.tasks().is_accepting(),
            live_tasks: service.tasks().live_count(),
            taken_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartOutcome {
    pub before: RestartSnapshot,
    pub after: RestartSnapshot,
    /// Whether a configuration file was read successfully
    pub config_reloaded: bool,
    /// Reinitialization attempts made, including the successful one
    pub attempts: u32,
    /// Tasks cancelled because they outlived the drain timeout
    pub tasks_cancelled: usize,
    pub elapsed_ms: u64,
}

pub struct RestartManager {
    service: Arc<Service>,
    active: AtomicBool,
}

impl RestartManager {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            active: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        info!("Restart manager started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        info!("Restart manager stopped");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn restart(&self) -> Result<RestartOutcome> {
        if !self.is_active() {
            return Err(EngineError::NotRunning("restart manager"));
        }

        let guard = self.service.lifecycle().begin(Sequence::Restart)?;
        let started = Instant::now();
        let service = &self.service;

        let before = RestartSnapshot::capture(service);
        info!(
            max_workers = before.max_workers,
            executor = %before.executor_status,
            live_tasks = before.live_tasks,
            "Restart requested"
        );

        let tasks_cancelled = self.drain_tasks();
        self.stop_components();

        let (config, config_reloaded) = self.reload_config();
        if let Err(e) = service.apply_config(config) {
            error!("Reloaded configuration rejected, keeping previous: {}", e);
            if let Err(e) = service.apply_config(service.config()) {
                error!("Failed to re-apply previous configuration: {}", e);
            }
        }

        let lifecycle = service.config().lifecycle;
        let max_attempts = lifecycle.restart_attempts.max(1);
        let backoff = lifecycle.restart_backoff();

        let mut attempts = 0;
        let mut last_error = None;
        while attempts < max_attempts {
            attempts += 1;
            match service.start_components() {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempts, max_attempts, "Reinitialization failed: {}", e);
                    last_error = Some(e);
                    if attempts < max_attempts {
                        thread::sleep(backoff * attempts);
                    }
                }
            }
        }

        if let Some(e) = last_error {
            // Nothing half-started keeps running behind a degraded engine
            self.stop_components();
            guard.finish(LifecyclePhase::Degraded);
            error!(attempts, "Restart failed, engine degraded: {}", e);
            return Err(EngineError::RestartFailed(format!(
                "reinitialization failed after {} attempts: {}",
                attempts, e
            )));
        }

        guard.finish(LifecyclePhase::Idle);
        let after = RestartSnapshot::capture(service);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            attempts,
            config_reloaded,
            max_workers = after.max_workers,
            elapsed_ms,
            "Restart complete"
        );

        Ok(RestartOutcome {
            before,
            after,
            config_reloaded,
            attempts,
            tasks_cancelled,
            elapsed_ms,
        })
    }

    /// Close submissions and wait up to `shutdown_wait_timeout` for live
    /// tasks, cancelling whatever is left so the pool drain is bounded
    fn drain_tasks(&self) -> usize {
        let tasks = self.service.tasks();
        let wait = self.service.config().lifecycle.shutdown_wait_timeout();

        tasks.stop_accepting();
        if tasks.wait_idle(wait) {
            return 0;
        }

        let cancelled = tasks.cancel_all();
        warn!(cancelled, wait = ?wait, "Tasks cancelled to let restart proceed");
        cancelled
    }

    /// Reverse dependency order; each failure is logged and the rest continue
    fn stop_components(&self) {
        let service = &self.service;
        service.tasks().stop_accepting();

        let steps: [(&str, Result<()>); 4] = [
            ("task monitor", service.tasks().stop()),
            ("process manager", service.processes().stop()),
            ("worker pool", service.executor().stop()),
            ("sandbox executor", service.sandbox().stop()),
        ];
        for (component, outcome) in steps {
            if let Err(e) = outcome {
                error!(component, "Stop failed during restart: {}", e);
            }
        }
    }

    /// Read the configuration file again; on failure keep the current one
    fn reload_config(&self) -> (EngineConfig, bool) {
        let Some(path) = self.service.config_path() else {
            info!("No configuration file, keeping current settings");
            return (self.service.config(), false);
        };

        match EngineConfig::load_from(Some(path)) {
            Ok(config) => {
                info!(path = %path.display(), "Configuration reloaded");
                (config, true)
            }
            Err(e) => {
                error!(path = %path.display(), "Configuration reload failed, keeping current: {}", e);
                (self.service.config(), false)
            }
        }
    }
}
