// src/sandbox/executor.rs
//! Sandbox executor
//!
//! Turns a task record into an [`ExecutionUnit`]: a per-task working
//! directory, the resolved language runtime, stdout/stderr log files, and the
//! isolation strategy to apply when the command is spawned.

use crate::runtime::process::{supervise, CommandSpec, ProcessExit};
use crate::runtime::worker_pool::ExecContext;
use crate::sandbox::environment::EnvironmentManager;
use crate::sandbox::isolation::{build_strategy, IsolationStrategy};
use crate::sandbox::resource_limits::ResourceLimits;
use crate::tasks::model::Task;
use crate::utils::config::{ExecutionPaths, SandboxConfig};
use crate::utils::errors::{EngineError, Result};
use parking_lot::RwLock;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Bytes of stdout kept as a task's result text
pub const RESULT_TAIL_BYTES: u64 = 4096;

/// A prepared, not yet started task command
pub struct ExecutionUnit {
    pub task_id: String,
    pub spec: CommandSpec,
    pub task_dir: PathBuf,
    pub runtime_path: Option<PathBuf>,
    isolation: Arc<dyn IsolationStrategy>,
    kill_grace: Duration,
}

impl ExecutionUnit {
    /// Spawn under the isolation strategy and wait, honoring `ctx`
    pub fn run(&self, ctx: &ExecContext) -> Result<ProcessExit> {
        let mut command = self.spec.to_command()?;
        self.isolation.prepare(&mut command, &self.task_dir)?;

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("{}: {}", self.spec.program, e))
        })?;
        let pid = child.id();
        debug!(task_id = %self.task_id, pid, "Task process spawned");

        if let Err(e) = self.isolation.attach(pid) {
            warn!(task_id = %self.task_id, pid, "Isolation attach failed: {}", e);
        }

        let outcome = supervise(&mut child, ctx, self.kill_grace);
        self.isolation.release(pid);
        outcome
    }

    /// Last [`RESULT_TAIL_BYTES`] of stdout, if anything was written
    pub fn output_tail(&self) -> Option<String> {
        let path = self.spec.stdout.as_ref()?;
        let mut file = fs::File::open(path).ok()?;
        let len = file.metadata().ok()?.len();
        if len == 0 {
            return None;
        }
        file.seek(SeekFrom::Start(len.saturating_sub(RESULT_TAIL_BYTES)))
            .ok()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).ok()?;
        Some(String::from_utf8_lossy(&buf).trim_end().to_string())
    }
}

/// Settings that may change across a restart
struct Policy {
    isolation: Arc<dyn IsolationStrategy>,
    kill_grace: Duration,
    cleanup_on_finish: bool,
}

impl Policy {
    fn from_config(config: &SandboxConfig) -> Result<Self> {
        let limits = ResourceLimits::from_config(&config.resource_limits)?;
        Ok(Self {
            isolation: build_strategy(&config.isolation, limits)?,
            kill_grace: config.kill_grace(),
            cleanup_on_finish: config.cleanup_on_finish,
        })
    }
}

pub struct SandboxExecutor {
    paths: ExecutionPaths,
    environments: Arc<EnvironmentManager>,
    policy: RwLock<Policy>,
    running: AtomicBool,
}

impl SandboxExecutor {
    pub fn new(config: &SandboxConfig, environments: Arc<EnvironmentManager>) -> Result<Self> {
        Ok(Self {
            paths: config.execution.clone(),
            environments,
            policy: RwLock::new(Policy::from_config(config)?),
            running: AtomicBool::new(false),
        })
    }

    /// Swap isolation, limits, grace period and cleanup behavior.
    ///
    /// Only allowed while stopped; directory layout is fixed at construction.
    pub fn reconfigure(&self, config: &SandboxConfig) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning("sandbox executor"));
        }
        if config.execution.base_path != self.paths.base_path {
            warn!(
                configured = %config.execution.base_path.display(),
                current = %self.paths.base_path.display(),
                "Sandbox paths cannot change without a process restart"
            );
        }

        let policy = Policy::from_config(config)?;
        info!(isolation = policy.isolation.name(), "Sandbox executor reconfigured");
        *self.policy.write() = policy;
        Ok(())
    }

    /// Create base, tasks, temp and locks directories and start accepting work
    pub fn init(&self) -> Result<()> {
        for dir in [
            &self.paths.base_path,
            &self.paths.tasks_path,
            &self.paths.temp_path,
            &self.paths.locks_path,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                EngineError::Sandbox(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            base = %self.paths.base_path.display(),
            isolation = self.isolation_name(),
            "Sandbox executor initialized"
        );
        Ok(())
    }

    /// Resume after [`stop`](Self::stop)
    pub fn start(&self) -> Result<()> {
        self.init()
    }

    /// Refuse further `prepare` calls and clear the temp directory
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Sandbox executor already stopped");
            return Ok(());
        }

        if self.paths.temp_path.exists() {
            fs::remove_dir_all(&self.paths.temp_path)?;
            fs::create_dir_all(&self.paths.temp_path)?;
        }

        info!("Sandbox executor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn isolation_name(&self) -> &'static str {
        self.policy.read().isolation.name()
    }

    pub fn task_directory(&self, task_id: &str) -> PathBuf {
        self.paths.tasks_path.join(task_id)
    }

    pub fn create_task_directory(&self, task_id: &str) -> Result<PathBuf> {
        check_task_id(task_id)?;
        let dir = self.task_directory(task_id);
        fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Sandbox(format!("failed to create {}: {}", dir.display(), e))
        })?;
        debug!(task_id, path = %dir.display(), "Created task directory");
        Ok(dir)
    }

    /// Remove a task's directory; a missing directory is not an error
    pub fn cleanup_task_directory(&self, task_id: &str) -> Result<()> {
        check_task_id(task_id)?;
        let dir = self.task_directory(task_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(task_id, path = %dir.display(), "Removed task directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Sandbox(format!(
                "failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    /// Called once a task is terminal
    pub fn finish(&self, task_id: &str) {
        if self.policy.read().cleanup_on_finish {
            if let Err(e) = self.cleanup_task_directory(task_id) {
                warn!(task_id, "Task directory cleanup failed: {}", e);
            }
        }
    }

    /// Resolve the runtime, create the task directory and build the unit
    pub fn prepare(&self, task: &Task) -> Result<ExecutionUnit> {
        if !self.is_running() {
            return Err(EngineError::NotRunning("sandbox executor"));
        }
        task.validate()?;

        let runtime_path = match &task.runtime {
            Some(req) => Some(self.environments.get_path(req.kind, &req.version)?),
            None => None,
        };

        let task_dir = self.create_task_directory(&task.id)?;
        let cwd = task.working_dir.clone().unwrap_or_else(|| task_dir.clone());

        let mut env = vec![
            ("TASKFLOW_TASK_ID".to_string(), task.id.clone()),
            ("TASKFLOW_TASK_DIR".to_string(), task_dir.display().to_string()),
            ("TMPDIR".to_string(), self.paths.temp_path.display().to_string()),
        ];
        if let Some(root) = &runtime_path {
            let inherited = std::env::var("PATH").unwrap_or_default();
            let bin = root.join("bin");
            let path = if inherited.is_empty() {
                bin.display().to_string()
            } else {
                format!("{}:{}", bin.display(), inherited)
            };
            env.push(("PATH".to_string(), path));
        }

        let mut spec = CommandSpec::new(task.command.clone(), cwd).args(task.args.iter().cloned());
        spec.env = env;
        spec.stdout = Some(task_dir.join(STDOUT_LOG));
        spec.stderr = Some(task_dir.join(STDERR_LOG));

        let policy = self.policy.read();
        Ok(ExecutionUnit {
            task_id: task.id.clone(),
            spec,
            task_dir,
            runtime_path,
            isolation: Arc::clone(&policy.isolation),
            kill_grace: policy.kill_grace,
        })
    }
}

fn check_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty() || task_id.starts_with('.') || task_id.contains(std::path::is_separator) {
        return Err(EngineError::InvalidArgument(format!(
            "task id '{}' is not a valid directory name",
            task_id
        )));
    }
    Ok(())
}
