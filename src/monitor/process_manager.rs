// src/monitor/process_manager.rs
//! OS process snapshots
//!
//! Periodically reads the process table through a [`ProcessSource`] and keeps
//! the latest snapshot for observability queries. Independent of task
//! execution; it only shares the monitor cadence.

use crate::observability::PROCESSES_OBSERVED;
use crate::runtime::process;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, Process, ProcessStatus, System};
use tracing::{debug, info, warn};

/// One process as seen in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Zero when the parent is unknown
    pub parent_pid: u32,
    pub name: String,
    /// Arguments joined by spaces; empty for kernel threads
    pub cmdline: String,
    /// Scheduler state, e.g. `running`, `sleeping`, `zombie`
    pub status: String,
    /// Resident set size
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    /// CPU share since the previous refresh, in percent of one core
    pub cpu_usage: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Aggregate over the latest snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub total_processes: usize,
    pub running_processes: usize,
    /// Mean CPU usage across the snapshot
    pub cpu_usage: f64,
    pub memory_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Where process information comes from
pub trait ProcessSource: Send + Sync {
    /// Up to `limit` processes, lowest PIDs first
    fn snapshot(&self, limit: usize) -> Result<Vec<ProcessInfo>>;

    fn read_process(&self, pid: u32) -> Result<ProcessInfo>;
}

/// The OS process table as reported by `sysinfo`.
///
/// CPU usage is measured between refreshes, so the first snapshot reports
/// zero for every process.
pub struct SystemSource {
    system: Mutex<System>,
}

impl SystemSource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SystemSource {
    fn snapshot(&self, limit: usize) -> Result<Vec<ProcessInfo>> {
        let mut system = self.system.lock();
        system.refresh_processes();

        let observed_at = Utc::now();
        let mut processes: Vec<ProcessInfo> = system
            .processes()
            .values()
            .map(|p| describe(p, observed_at))
            .collect();
        processes.sort_unstable_by_key(|p| p.pid);
        processes.truncate(limit);
        Ok(processes)
    }

    fn read_process(&self, pid: u32) -> Result<ProcessInfo> {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return Err(EngineError::ProcessNotFound(pid.as_u32()));
        }
        system
            .process(pid)
            .map(|p| describe(p, Utc::now()))
            .ok_or(EngineError::ProcessNotFound(pid.as_u32()))
    }
}

fn describe(process: &Process, observed_at: DateTime<Utc>) -> ProcessInfo {
    ProcessInfo {
        pid: process.pid().as_u32(),
        parent_pid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
        name: process.name().to_string(),
        cmdline: process.cmd().join(" "),
        status: status_name(process.status()).to_string(),
        memory_bytes: process.memory(),
        virtual_memory_bytes: process.virtual_memory(),
        cpu_usage: f64::from(process.cpu_usage()),
        started_at: Utc.timestamp_opt(process.start_time() as i64, 0).single(),
        observed_at,
    }
}

fn status_name(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Run => "running",
        ProcessStatus::Sleep => "sleeping",
        ProcessStatus::Idle => "idle",
        ProcessStatus::Stop => "stopped",
        ProcessStatus::Zombie => "zombie",
        ProcessStatus::Dead => "dead",
        ProcessStatus::UninterruptibleDiskSleep => "disk-sleep",
        _ => "unknown",
    }
}

#[derive(Default)]
struct Snapshot {
    processes: HashMap<u32, ProcessInfo>,
}

struct Monitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    source: Arc<dyn ProcessSource>,
    limit: usize,
    snapshot: RwLock<Snapshot>,
}

impl Shared {
    fn refresh(&self) -> Result<usize> {
        let fresh = self.source.snapshot(self.limit)?;

        let mut snapshot = self.snapshot.write();
        snapshot.processes = fresh.into_iter().map(|p| (p.pid, p)).collect();

        let count = snapshot.processes.len();
        metrics::gauge!(PROCESSES_OBSERVED).set(count as f64);
        debug!(processes = count, "Process snapshot refreshed");
        Ok(count)
    }
}

pub struct ProcessManager {
    shared: Arc<Shared>,
    enabled: bool,
    interval: RwLock<Duration>,
    kill_grace: Duration,
    monitor: Mutex<Option<Monitor>>,
}

impl ProcessManager {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        interval: Duration,
        limit: usize,
        kill_grace: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                limit,
                snapshot: RwLock::new(Snapshot::default()),
            }),
            enabled: true,
            interval: RwLock::new(interval),
            kill_grace,
            monitor: Mutex::new(None),
        }
    }

    /// OS-backed manager using the monitoring settings
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut manager = Self::new(
            Arc::new(SystemSource::new()),
            config.monitor_interval(),
            config.monitoring.process_limit,
            config.sandbox.kill_grace(),
        );
        manager.enabled = config.monitoring.process_monitoring;
        manager
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.interval.write() = interval;
    }

    /// Start the snapshot loop. No-op when already running or disabled.
    pub fn start(&self) -> Result<()> {
        if !self.enabled {
            info!("Process monitoring disabled");
            return Ok(());
        }

        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            debug!("Process manager already running");
            return Ok(());
        }

        if let Err(e) = self.shared.refresh() {
            warn!("Initial process snapshot failed: {}", e);
        }

        let interval = *self.interval.read();
        let shared = Arc::clone(&self.shared);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("taskflow-process-monitor".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = shared.refresh() {
                                warn!("Process snapshot failed: {}", e);
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Process monitor exiting");
            })
            .map_err(|e| {
                EngineError::RuntimeError(format!("failed to spawn process monitor: {}", e))
            })?;

        *monitor = Some(Monitor {
            stop: stop_tx,
            handle,
        });
        info!(interval = ?interval, limit = self.shared.limit, "Process manager started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let Some(monitor) = self.monitor.lock().take() else {
            return Ok(());
        };

        let _ = monitor.stop.send(());
        if monitor.handle.join().is_err() {
            warn!("Process monitor thread panicked");
        }
        info!("Process manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Take a snapshot now; returns the number of processes seen
    pub fn monitor_processes(&self) -> Result<usize> {
        self.shared.refresh()
    }

    /// Latest snapshot ordered by PID
    pub fn get_all_processes(&self) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = self
            .shared
            .snapshot
            .read()
            .processes
            .values()
            .cloned()
            .collect();
        processes.sort_by_key(|p| p.pid);
        processes
    }

    pub fn get_process(&self, pid: u32) -> Result<ProcessInfo> {
        self.shared
            .snapshot
            .read()
            .processes
            .get(&pid)
            .cloned()
            .ok_or(EngineError::ProcessNotFound(pid))
    }

    pub fn get_process_stats(&self) -> ProcessStats {
        let snapshot = self.shared.snapshot.read();
        let processes = &snapshot.processes;

        let mut stats = ProcessStats {
            total_processes: processes.len(),
            timestamp: Utc::now(),
            ..Default::default()
        };
        for info in processes.values() {
            stats.cpu_usage += info.cpu_usage;
            stats.memory_bytes += info.memory_bytes;
            if info.is_running() {
                stats.running_processes += 1;
            }
        }
        if !processes.is_empty() {
            stats.cpu_usage /= processes.len() as f64;
        }
        stats
    }

    /// SIGTERM a process, escalating to SIGKILL after the grace period
    pub fn terminate_process(&self, pid: u32) -> Result<()> {
        if pid <= 1 || pid == std::process::id() {
            return Err(EngineError::InvalidArgument(format!(
                "refusing to terminate PID {}",
                pid
            )));
        }

        if !process::terminate_pid(pid, self.kill_grace)? {
            self.shared.snapshot.write().processes.remove(&pid);
            return Err(EngineError::ProcessNotFound(pid));
        }

        self.shared.snapshot.write().processes.remove(&pid);
        info!(pid, "Process terminated");
        Ok(())
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
