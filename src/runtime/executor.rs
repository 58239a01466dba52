// src/runtime/executor.rs
//! Task executor service
//!
//! Owns the current [`WorkerPool`] and reports whether execution is running.
//! Restart tears the pool down and builds a new one from fresh settings.

use crate::runtime::worker_pool::{Job, PoolStats, WorkerPool, WorkerPoolConfig};
use crate::utils::errors::{EngineError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorStatus::Running => write!(f, "running"),
            ExecutorStatus::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct TaskExecutor {
    pool: RwLock<Arc<WorkerPool>>,
}

impl TaskExecutor {
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        Ok(Self {
            pool: RwLock::new(Arc::new(WorkerPool::new(config)?)),
        })
    }

    fn pool(&self) -> Arc<WorkerPool> {
        self.pool.read().clone()
    }

    pub fn start(&self) -> Result<()> {
        self.pool().start()?;
        info!("Task executor running");
        Ok(())
    }

    /// Stop the pool, draining queued jobs
    pub fn stop(&self) -> Result<()> {
        self.pool().stop()?;
        info!("Task executor stopped");
        Ok(())
    }

    /// Replace the pool with one built from `config`. The executor must be stopped.
    pub fn reconfigure(&self, config: WorkerPoolConfig) -> Result<()> {
        let mut pool = self.pool.write();
        if pool.is_running() {
            return Err(EngineError::AlreadyRunning("task executor"));
        }

        *pool = Arc::new(WorkerPool::new(config.clone())?);
        info!(
            max_workers = config.max_workers,
            max_queue = config.max_queue,
            task_timeout = ?config.task_timeout,
            "Task executor reconfigured"
        );
        Ok(())
    }

    pub fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        self.pool().submit(job)
    }

    pub fn cancel_task(&self, id: &str) -> bool {
        self.pool().cancel_task(id)
    }

    pub fn cancel_all(&self) -> usize {
        self.pool().cancel_all()
    }

    pub fn status(&self) -> ExecutorStatus {
        if self.pool().is_running() {
            ExecutorStatus::Running
        } else {
            ExecutorStatus::Stopped
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool().stats()
    }

    pub fn config(&self) -> WorkerPoolConfig {
        self.pool().config().clone()
    }

    pub fn health_check(&self) -> Result<()> {
        match self.status() {
            ExecutorStatus::Running => Ok(()),
            ExecutorStatus::Stopped => Err(EngineError::NotRunning("task executor")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(max_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers,
            max_queue: 8,
            task_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_status_follows_pool() {
        let executor = TaskExecutor::new(config(2)).unwrap();
        assert_eq!(executor.status(), ExecutorStatus::Stopped);
        assert!(executor.health_check().is_err());

        executor.start().unwrap();
        assert_eq!(executor.status(), ExecutorStatus::Running);
        assert!(executor.health_check().is_ok());

        executor.stop().unwrap();
        assert_eq!(executor.status(), ExecutorStatus::Stopped);
    }

    #[test]
    fn test_reconfigure_requires_stopped() {
        let executor = TaskExecutor::new(config(2)).unwrap();
        executor.start().unwrap();
        assert!(matches!(
            executor.reconfigure(config(4)),
            Err(EngineError::AlreadyRunning(_))
        ));

        executor.stop().unwrap();
        executor.reconfigure(config(4)).unwrap();
        assert_eq!(executor.config().max_workers, 4);
        assert!(executor.reconfigure(config(0)).is_err());
        assert_eq!(executor.config().max_workers, 4);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ExecutorStatus::Running).unwrap(),
            "\"running\""
        );
    }
}
