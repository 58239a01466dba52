// src/lifecycle/shutdown.rs
//! Shutdown orchestration
//!
//! Steps run in a fixed order and a failing step is logged without aborting
//! the rest, unless `lifecycle.continue_on_step_failure` is off.

use crate::lifecycle::service::Service;
use crate::lifecycle::{LifecyclePhase, Sequence};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of one shutdown step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl StepReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub forced: bool,
    pub steps: Vec<StepReport>,
    /// Tasks cancelled because they were still live
    pub tasks_cancelled: usize,
    /// Steps never run because an earlier one failed
    pub skipped: Vec<String>,
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    /// Every step ran and succeeded
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.steps.iter().all(StepReport::succeeded)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| !s.succeeded())
    }
}

type Step<'a> = (&'static str, Box<dyn FnOnce(&mut ShutdownReport) -> Result<()> + 'a>);

fn step<'a>(
    name: &'static str,
    run: impl FnOnce(&mut ShutdownReport) -> Result<()> + 'a,
) -> Step<'a> {
    (name, Box::new(run))
}

pub struct ShutdownManager {
    service: Arc<Service>,
    active: AtomicBool,
}

impl ShutdownManager {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            active: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        info!("Shutdown manager started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        info!("Shutdown manager stopped");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting, wait for live tasks, then stop every component
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        self.run(false)
    }

    /// Cancel live tasks instead of waiting, then stop every component.
    ///
    /// While a graceful shutdown is in progress this cancels its remaining
    /// tasks so it finishes promptly, and reports the conflict.
    pub fn force_shutdown(&self) -> Result<ShutdownReport> {
        match self.run(true) {
            Err(EngineError::LifecycleConflict("shutdown")) => {
                let cancelled = self.service.tasks().cancel_all();
                warn!(cancelled, "Escalated running shutdown to forced");
                Err(EngineError::LifecycleConflict("shutdown"))
            }
            other => other,
        }
    }

    fn run(&self, forced: bool) -> Result<ShutdownReport> {
        if !self.is_active() {
            return Err(EngineError::NotRunning("shutdown manager"));
        }

        let guard = self.service.lifecycle().begin(Sequence::Shutdown)?;
        let started = Instant::now();
        let service = &self.service;
        let lifecycle = service.config().lifecycle;
        let wait = lifecycle.shutdown_wait_timeout();

        if forced {
            warn!("Forced shutdown requested");
        } else {
            info!(wait = ?wait, "Graceful shutdown requested");
        }

        let mut steps: Vec<Step<'_>> = vec![step("stop accepting submissions", |_| {
            service.tasks().stop_accepting();
            Ok(())
        })];

        if forced {
            steps.push(step("cancel active tasks", |report| {
                report.tasks_cancelled += service.tasks().cancel_all();
                Ok(())
            }));
        } else {
            steps.push(step("wait for active tasks", move |report| {
                if service.tasks().wait_idle(wait) {
                    return Ok(());
                }
                // Bound the remaining pool drain by the kill grace period
                report.tasks_cancelled += service.tasks().cancel_all();
                Err(EngineError::Timeout(format!("active tasks after {:?}", wait)))
            }));
        }

        steps.push(step("stop monitoring", |_| {
            let tasks = service.tasks().stop();
            let processes = service.processes().stop();
            tasks.and(processes)
        }));
        steps.push(step("stop worker pool", |_| service.executor().stop()));
        steps.push(step("stop sandbox executor", |_| service.sandbox().stop()));
        steps.push(step("release resources", |_| service.tasks().flush_store()));

        let mut report = ShutdownReport {
            forced,
            ..Default::default()
        };
        let mut aborted = false;

        for (name, run) in steps {
            if aborted {
                report.skipped.push(name.to_string());
                continue;
            }

            let step_started = Instant::now();
            let outcome = run(&mut report);
            let elapsed_ms = step_started.elapsed().as_millis() as u64;

            match &outcome {
                Ok(()) => info!(step = name, elapsed_ms, "Shutdown step complete"),
                Err(e) => error!(step = name, elapsed_ms, "Shutdown step failed: {}", e),
            }
            report.steps.push(StepReport {
                step: name.to_string(),
                error: outcome.err().map(|e| e.to_string()),
                elapsed_ms,
            });

            let failed = report.steps.last().map_or(false, |s| !s.succeeded());
            if failed && !lifecycle.continue_on_step_failure {
                warn!(step = name, "Aborting shutdown after failed step");
                aborted = true;
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if aborted {
            guard.finish(LifecyclePhase::Degraded);
        } else {
            guard.finish(LifecyclePhase::Stopped);
        }

        info!(
            forced,
            clean = report.is_clean(),
            tasks_cancelled = report.tasks_cancelled,
            elapsed_ms = report.elapsed_ms,
            "Shutdown finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::ExecutorStatus;
    use crate::tasks::model::{Task, TaskStatus};
    use crate::utils::config::{EngineConfig, IsolationKind, SandboxConfig};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn service(root: &Path, wait: &str) -> Arc<Service> {
        let mut config = EngineConfig::default();
        config.threadpool.max_workers = 2;
        config.monitoring.interval = "50ms".to_string();
        config.monitoring.process_monitoring = false;
        config.sandbox = SandboxConfig::default().with_root(root);
        config.sandbox.isolation.strategy = IsolationKind::None;
        config.sandbox.kill_grace = "200ms".to_string();
        config.lifecycle.shutdown_wait_timeout = wait.to_string();

        let service = Arc::new(Service::new(config, None).unwrap());
        service.start().unwrap();
        service
    }

    fn manager(service: &Arc<Service>) -> ShutdownManager {
        let manager = ShutdownManager::new(Arc::clone(service));
        manager.start().unwrap();
        manager
    }

    fn sh(script: &str) -> Task {
        Task::new(script, "sh").with_args(["-c", script])
    }

    #[test]
    fn test_graceful_waits_for_tasks() {
        let dir = tempdir().unwrap();
        let service = service(dir.path(), "10s");
        let ids: Vec<_> = (0..3)
            .map(|_| service.submit_task(sh("sleep 0.3")).unwrap())
            .collect();

        let report = manager(&service).shutdown().unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert!(!report.forced);
        assert_eq!(report.tasks_cancelled, 0);

        for id in ids {
            assert_eq!(service.get_task(&id).unwrap().status, TaskStatus::Completed);
        }
        assert_eq!(service.phase(), LifecyclePhase::Stopped);
        assert_eq!(service.get_executor_status(), ExecutorStatus::Stopped);
        assert!(matches!(
            service.submit_task(sh("true")),
            Err(EngineError::SubmissionsClosed)
        ));
    }

    #[test]
    fn test_graceful_wait_is_bounded() {
        let dir = tempdir().unwrap();
        let service = service(dir.path(), "300ms");
        let id = service.submit_task(sh("sleep 30")).unwrap();

        let started = Instant::now();
        let report = manager(&service).shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        let wait = &report.steps[1];
        assert_eq!(wait.step, "wait for active tasks");
        assert!(!wait.succeeded());
        assert_eq!(report.failed_steps().count(), 1);
        assert_eq!(report.tasks_cancelled, 1);
        assert_eq!(service.get_task(&id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(service.phase(), LifecyclePhase::Stopped);
    }

    #[test]
    fn test_force_cancels_live_tasks() {
        let dir = tempdir().unwrap();
        let service = service(dir.path(), "30s");
        let running = service.submit_task(sh("sleep 30")).unwrap();

        let report = manager(&service).force_shutdown().unwrap();
        assert!(report.forced);
        assert_eq!(report.steps[1].step, "cancel active tasks");
        assert_eq!(report.tasks_cancelled, 1);
        assert_eq!(service.get_task(&running).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_second_shutdown_rejected() {
        let dir = tempdir().unwrap();
        let service = service(dir.path(), "1s");
        let manager = manager(&service);

        manager.shutdown().unwrap();
        assert!(matches!(
            manager.shutdown(),
            Err(EngineError::InvalidLifecycleState(_))
        ));
    }

    #[test]
    fn test_inactive_manager_refuses() {
        let dir = tempdir().unwrap();
        let service = service(dir.path(), "1s");
        let manager = ShutdownManager::new(Arc::clone(&service));
        assert!(matches!(manager.shutdown(), Err(EngineError::NotRunning(_))));
    }
}
