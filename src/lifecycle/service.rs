// src/lifecycle/service.rs
//! Composition root
//!
//! [`Service`] builds every component from one [`EngineConfig`], owns them for
//! the life of the process, and exposes the operations outer surfaces (an
//! HTTP layer, the operator console) call into.

use crate::lifecycle::{Lifecycle, LifecyclePhase};
use crate::monitor::process_manager::{ProcessInfo, ProcessManager, ProcessStats};
use crate::runtime::executor::{ExecutorStatus, TaskExecutor};
use crate::runtime::worker_pool::{PoolStats, WorkerPoolConfig};
use crate::sandbox::environment::{EnvironmentManager, EnvironmentRecord, RuntimeKind};
use crate::sandbox::executor::SandboxExecutor;
use crate::tasks::manager::TaskManager;
use crate::tasks::model::{Task, TaskStats};
use crate::tasks::store::{SqliteTaskStore, TaskStore};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct Service {
    config: RwLock<EngineConfig>,
    config_path: Option<PathBuf>,
    lifecycle: Lifecycle,
    environments: Arc<EnvironmentManager>,
    sandbox: Arc<SandboxExecutor>,
    executor: Arc<TaskExecutor>,
    tasks: Arc<TaskManager>,
    processes: Arc<ProcessManager>,
}

impl Service {
    /// Build every component. Nothing is started and no thread is spawned.
    ///
    /// `config_path` is where a restart reloads configuration from.
    pub fn new(config: EngineConfig, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;

        let environments = Arc::new(EnvironmentManager::new(
            config.sandbox.environments.clone(),
        ));
        let sandbox = Arc::new(SandboxExecutor::new(
            &config.sandbox,
            Arc::clone(&environments),
        )?);
        let executor = Arc::new(TaskExecutor::new(WorkerPoolConfig::from_engine(&config)?)?);

        let store: Option<Arc<dyn TaskStore>> = match &config.storage.database_path {
            Some(path) => Some(Arc::new(SqliteTaskStore::open(path)?)),
            None => None,
        };

        let tasks = Arc::new(TaskManager::new(
            Arc::clone(&executor),
            Arc::clone(&sandbox),
            store,
            config.monitor_interval(),
        ));
        let processes = Arc::new(ProcessManager::from_config(&config));

        Ok(Self {
            config: RwLock::new(config),
            config_path,
            lifecycle: Lifecycle::new(),
            environments,
            sandbox,
            executor,
            tasks,
            processes,
        })
    }

    /// First start: scan runtimes, restore persisted tasks, start components
    pub fn start(&self) -> Result<()> {
        self.environments.init()?;

        let interrupted = self.tasks.restore_from_store()?;
        if interrupted > 0 {
            info!(interrupted, "Tasks from the previous run marked failed");
        }

        self.start_components()?;
        info!(
            app = %self.config.read().app.name,
            workers = self.executor.config().max_workers,
            isolation = self.sandbox.isolation_name(),
            "Service started"
        );
        Ok(())
    }

    /// Start in dependency order: sandbox, executor, task manager, process manager.
    ///
    /// Each step is a no-op for a component that is already running, so a
    /// failed attempt can simply be repeated.
    pub fn start_components(&self) -> Result<()> {
        self.sandbox.start()?;
        self.executor.start()?;
        self.tasks.start()?;
        self.processes.start()?;
        self.tasks.resume_accepting();
        Ok(())
    }

    /// Push a configuration into stopped components and keep it as current
    pub(crate) fn apply_config(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;

        self.executor
            .reconfigure(WorkerPoolConfig::from_engine(&config)?)?;
        self.sandbox.reconfigure(&config.sandbox)?;

        let interval = config.monitor_interval();
        self.tasks.set_monitor_interval(interval);
        self.processes.set_interval(interval);

        *self.config.write() = config;
        Ok(())
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    pub fn environments(&self) -> &Arc<EnvironmentManager> {
        &self.environments
    }

    pub fn sandbox(&self) -> &Arc<SandboxExecutor> {
        &self.sandbox
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    // Collaborator-facing operations

    pub fn submit_task(&self, task: Task) -> Result<String> {
        self.tasks.submit_task(task)
    }

    pub fn resubmit_task(&self, id: &str) -> Result<()> {
        self.tasks.resubmit_task(id)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks.get_task(id)
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        self.tasks.get_all_tasks()
    }

    pub fn update_task(&self, id: &str, task: Task) -> Result<()> {
        self.tasks.update_task(id, task)
    }

    pub fn cancel_task(&self, id: &str) -> Result<()> {
        self.tasks.cancel_task(id)
    }

    pub fn retry_task(&self, id: &str) -> Result<()> {
        self.tasks.retry_task(id)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.delete_task(id)
    }

    pub fn get_task_stats(&self) -> TaskStats {
        self.tasks.get_task_stats()
    }

    pub fn get_thread_pool_stats(&self) -> PoolStats {
        self.tasks.get_thread_pool_stats()
    }

    pub fn get_executor_status(&self) -> ExecutorStatus {
        self.executor.status()
    }

    pub fn get_process_list(&self) -> Vec<ProcessInfo> {
        self.processes.get_all_processes()
    }

    pub fn get_process_stats(&self) -> ProcessStats {
        self.processes.get_process_stats()
    }

    pub fn terminate_process(&self, pid: u32) -> Result<()> {
        self.processes.terminate_process(pid)
    }

    pub fn list_environments(&self) -> Vec<EnvironmentRecord> {
        self.environments.list_environments()
    }

    pub fn install_environment(
        &self,
        kind: RuntimeKind,
        version: &str,
        installer: &Path,
    ) -> Result<EnvironmentRecord> {
        self.environments.install_environment(kind, version, installer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskStatus;
    use crate::utils::config::{IsolationKind, SandboxConfig};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn config(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.threadpool.max_workers = 2;
        config.monitoring.interval = "50ms".to_string();
        config.monitoring.process_limit = 10;
        config.sandbox = SandboxConfig::default().with_root(root);
        config.sandbox.isolation.strategy = IsolationKind::None;
        config.sandbox.kill_grace = "200ms".to_string();
        config.storage.database_path = Some(root.join("tasks.db"));
        config
    }

    #[test]
    fn test_start_and_run_task() {
        let dir = tempdir().unwrap();
        let service = Service::new(config(dir.path()), None).unwrap();
        assert_eq!(service.get_executor_status(), ExecutorStatus::Stopped);

        service.start().unwrap();
        assert_eq!(service.get_executor_status(), ExecutorStatus::Running);
        assert_eq!(service.phase(), LifecyclePhase::Idle);
        assert!(!service.get_process_list().is_empty());

        let id = service
            .submit_task(Task::new("hello", "sh").with_args(["-c", "echo hi"]))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while service.get_task(&id).unwrap().status != TaskStatus::Completed {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(service.get_task_stats().completed, 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let mut bad = config(dir.path());
        bad.threadpool.max_workers = 0;
        assert!(Service::new(bad, None).is_err());
    }

    #[test]
    fn test_start_restores_persisted_tasks() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());

        let pending = Task::new("left behind", "true");
        {
            let store = SqliteTaskStore::open(cfg.storage.database_path.as_ref().unwrap()).unwrap();
            store.save(&pending).unwrap();
        }

        let service = Service::new(cfg, None).unwrap();
        service.start().unwrap();
        let task = service.get_task(&pending.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
}
