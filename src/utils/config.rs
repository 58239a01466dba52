// src/utils/config.rs
//! Engine configuration
//!
//! Loaded from a YAML file with `TASKFLOW__SECTION__KEY` environment
//! overrides layered on top. Durations and sizes stay strings in the file
//! (`30s`, `512MB`) and are parsed through accessors so that a bad value is
//! reported against the key that carried it.

use crate::utils::errors::{EngineError, Result};
use crate::utils::units::{parse_duration, parse_size};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Config file used when `TASKFLOW_CONFIG` is not set
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.yaml";

/// Monitor cadence used when the configured interval does not parse
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Shutdown wait used when the configured timeout does not parse
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub app: AppConfig,
    pub threadpool: ThreadPoolConfig,
    pub monitoring: MonitoringConfig,
    pub sandbox: SandboxConfig,
    pub lifecycle: LifecycleConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "taskflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Number of worker threads
    pub max_workers: usize,

    /// Queue slots before `submit` starts blocking
    pub max_queue: usize,

    /// Per-task deadline (humantime)
    pub task_timeout: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue: 100,
            task_timeout: "30m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Poll interval shared by the task monitor and process manager
    pub interval: String,

    /// Enable periodic OS process snapshots
    pub process_monitoring: bool,

    /// Upper bound on processes kept per snapshot
    pub process_limit: usize,

    /// Prometheus listen address; metrics export is off when unset
    pub metrics_addr: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            process_monitoring: true,
            process_limit: 100,
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub execution: ExecutionPaths,
    pub environments: EnvironmentsConfig,
    pub isolation: IsolationConfig,
    pub resource_limits: ResourceLimitsConfig,

    /// Remove a task's directory once it reaches a terminal state
    pub cleanup_on_finish: bool,

    /// Time between SIGTERM and SIGKILL when a task is terminated
    pub kill_grace: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionPaths::default(),
            environments: EnvironmentsConfig::default(),
            isolation: IsolationConfig::default(),
            resource_limits: ResourceLimitsConfig::default(),
            cleanup_on_finish: false,
            kill_grace: "2s".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Rebase every sandbox path under `root`
    pub fn with_root(mut self, root: &Path) -> Self {
        self.execution = ExecutionPaths::under(&root.join("execution"));
        self.environments = EnvironmentsConfig::under(&root.join("environments"));
        self
    }

    pub fn kill_grace(&self) -> Duration {
        parse_duration(&self.kill_grace).unwrap_or(Duration::from_secs(2))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPaths {
    pub base_path: PathBuf,
    pub tasks_path: PathBuf,
    pub temp_path: PathBuf,
    pub locks_path: PathBuf,
}

impl ExecutionPaths {
    pub fn under(base: &Path) -> Self {
        Self {
            base_path: base.to_path_buf(),
            tasks_path: base.join("tasks"),
            temp_path: base.join("temp"),
            locks_path: base.join("locks"),
        }
    }
}

impl Default for ExecutionPaths {
    fn default() -> Self {
        Self::under(Path::new("sandbox/execution"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentsConfig {
    pub base_path: PathBuf,
    pub python: RuntimePaths,
    pub java: RuntimePaths,
}

impl EnvironmentsConfig {
    pub fn under(base: &Path) -> Self {
        Self {
            base_path: base.to_path_buf(),
            python: RuntimePaths::under(&base.join("python")),
            java: RuntimePaths::under(&base.join("java")),
        }
    }
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self::under(Path::new("sandbox/environments"))
    }
}

/// Directory layout for one runtime type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePaths {
    pub base_path: PathBuf,
    pub installers_path: PathBuf,
    pub versions_path: PathBuf,
}

impl RuntimePaths {
    pub fn under(base: &Path) -> Self {
        Self {
            base_path: base.to_path_buf(),
            installers_path: base.join("installers"),
            versions_path: base.join("versions"),
        }
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::under(Path::new("sandbox/environments/runtime"))
    }
}

/// Which isolation strategy the sandbox applies to task processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// setrlimit / affinity / uid drop / chroot in the child before exec
    Rlimit,
    /// cgroup v2 memory.max and cpu.max per task process
    Cgroup,
    /// No isolation; tests only
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub strategy: IsolationKind,
    pub chroot: bool,
    pub user: Option<String>,
    pub group: Option<String>,

    /// Parent cgroup under which per-task cgroups are created
    pub cgroup_root: PathBuf,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            strategy: IsolationKind::Rlimit,
            chroot: false,
            user: None,
            group: None,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/taskflow"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    /// Memory ceiling per task process (`512MB`)
    pub memory: String,

    /// CPU cores a task process may run on
    pub cpu_cores: usize,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            memory: "512MB".to_string(),
            cpu_cores: 1,
        }
    }
}

impl ResourceLimitsConfig {
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_size(&self.memory)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on waiting for active tasks during graceful shutdown
    pub shutdown_wait_timeout: String,

    /// Re-initialization attempts before a restart is declared degraded
    pub restart_attempts: u32,

    /// Pause between re-initialization attempts
    pub restart_backoff: String,

    /// Keep running the shutdown sequence after a step fails
    pub continue_on_step_failure: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_wait_timeout: "30s".to_string(),
            restart_attempts: 3,
            restart_backoff: "1s".to_string(),
            continue_on_step_failure: true,
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_wait_timeout(&self) -> Duration {
        parse_duration(&self.shutdown_wait_timeout).unwrap_or_else(|e| {
            warn!("{}, waiting {:?}", e, DEFAULT_SHUTDOWN_WAIT);
            DEFAULT_SHUTDOWN_WAIT
        })
    }

    pub fn restart_backoff(&self) -> Duration {
        parse_duration(&self.restart_backoff).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file mirroring task records; in-memory only when unset
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl EngineConfig {
    /// Load from `TASKFLOW_CONFIG`, falling back to the default path when it
    /// exists and to built-in defaults otherwise
    pub fn load() -> Result<Self> {
        Self::load_from(Self::resolve_path().as_deref())
    }

    /// The file [`load`](Self::load) reads, if any
    pub fn resolve_path() -> Option<PathBuf> {
        std::env::var_os("TASKFLOW_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            })
    }

    /// Load from an explicit file (or defaults when `None`) plus environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(EngineError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TASKFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as YAML
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| EngineError::Config(format!("serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.threadpool.max_workers == 0 {
            return Err(EngineError::Config(
                "threadpool.max_workers must be greater than 0".to_string(),
            ));
        }

        if self.threadpool.max_queue == 0 {
            return Err(EngineError::Config(
                "threadpool.max_queue must be greater than 0".to_string(),
            ));
        }

        self.task_timeout()?;

        self.sandbox
            .resource_limits
            .memory_bytes()
            .map_err(|e| EngineError::Config(format!("sandbox.resource_limits.memory: {}", e)))?;

        if self.sandbox.resource_limits.cpu_cores < 1 {
            return Err(EngineError::Config(
                "sandbox.resource_limits.cpu_cores must be at least 1".to_string(),
            ));
        }

        parse_duration(&self.sandbox.kill_grace)
            .map_err(|e| EngineError::Config(format!("sandbox.kill_grace: {}", e)))?;

        Ok(())
    }

    /// Per-task deadline; must be non-zero
    pub fn task_timeout(&self) -> Result<Duration> {
        let timeout = parse_duration(&self.threadpool.task_timeout)
            .map_err(|e| EngineError::Config(format!("threadpool.task_timeout: {}", e)))?;
        if timeout.is_zero() {
            return Err(EngineError::Config(
                "threadpool.task_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(timeout)
    }

    /// Monitor cadence; a malformed value falls back to five seconds
    pub fn monitor_interval(&self) -> Duration {
        match parse_duration(&self.monitoring.interval) {
            Ok(interval) if !interval.is_zero() => interval,
            Ok(_) => {
                warn!("monitoring.interval is zero, using {:?}", DEFAULT_MONITOR_INTERVAL);
                DEFAULT_MONITOR_INTERVAL
            }
            Err(e) => {
                warn!("monitoring.interval: {}, using {:?}", e, DEFAULT_MONITOR_INTERVAL);
                DEFAULT_MONITOR_INTERVAL
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threadpool.max_workers, 4);
        assert_eq!(config.task_timeout().unwrap(), Duration::from_secs(1800));
    }

    #[test]
    fn test_monitor_interval_fallback() {
        let mut config = EngineConfig::default();
        config.monitoring.interval = "every so often".to_string();
        assert_eq!(config.monitor_interval(), DEFAULT_MONITOR_INTERVAL);

        config.monitoring.interval = "250ms".to_string();
        assert_eq!(config.monitor_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.threadpool.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.threadpool.task_timeout = "forever".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.threadpool.task_timeout = "0s".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.threadpool.max_queue = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sandbox.resource_limits.memory = "lots".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sandbox.resource_limits.cpu_cores = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(
            &path,
            "threadpool:\n  max_workers: 7\n  task_timeout: 10s\nmonitoring:\n  interval: 1s\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.threadpool.max_workers, 7);
        assert_eq!(config.threadpool.max_queue, 100);
        assert_eq!(config.task_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.monitor_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "threadpool:\n  max_workers: 0\n").unwrap();

        assert!(EngineConfig::load_from(Some(&path)).is_err());
        assert!(EngineConfig::load_from(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.yaml");

        let mut config = EngineConfig::default();
        config.threadpool.max_workers = 2;
        config.sandbox = config.sandbox.with_root(dir.path());
        config.save_to(&path).unwrap();

        let reloaded = EngineConfig::load_from(Some(&path)).unwrap();
        assert_eq!(reloaded.threadpool.max_workers, 2);
        assert_eq!(
            reloaded.sandbox.execution.tasks_path,
            dir.path().join("execution").join("tasks")
        );
    }
}
