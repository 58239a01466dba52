// src/sandbox/isolation.rs
//! Process isolation strategies
//!
//! Provides:
//! - `rlimit`: address-space ceiling, CPU affinity, uid/gid drop and optional
//!   chroot, all applied in the child between fork and exec
//! - `cgroup`: per-process cgroup v2 group with `memory.max` and `cpu.max`
//! - `none`: nothing; for tests

use crate::sandbox::resource_limits::ResourceLimits;
use crate::utils::config::{IsolationConfig, IsolationKind};
use crate::utils::errors::{EngineError, Result};
use nix::unistd::{Group, User};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hooks around the life of one task process
pub trait IsolationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Configure `command` before it is spawned in `task_dir`
    fn prepare(&self, command: &mut Command, task_dir: &Path) -> Result<()>;

    /// Called with the child's PID right after spawn
    fn attach(&self, _pid: u32) -> Result<()> {
        Ok(())
    }

    /// Called once the child has been reaped
    fn release(&self, _pid: u32) {}
}

/// Build the strategy selected in configuration
pub fn build_strategy(
    config: &IsolationConfig,
    limits: ResourceLimits,
) -> Result<Arc<dyn IsolationStrategy>> {
    let strategy: Arc<dyn IsolationStrategy> = match config.strategy {
        IsolationKind::Rlimit => Arc::new(RlimitIsolation::new(config, limits)?),
        IsolationKind::Cgroup => Arc::new(CgroupIsolation::new(config.cgroup_root.clone(), limits)),
        IsolationKind::None => Arc::new(NoIsolation::new()),
    };
    debug!("Isolation strategy: {}", strategy.name());
    Ok(strategy)
}

/// Limits applied with setrlimit/sched_setaffinity/chroot in the child
pub struct RlimitIsolation {
    limits: ResourceLimits,
    uid: Option<u32>,
    gid: Option<u32>,
    chroot: bool,
}

impl RlimitIsolation {
    pub fn new(config: &IsolationConfig, limits: ResourceLimits) -> Result<Self> {
        let uid = match &config.user {
            Some(name) => Some(lookup_user(name)?.uid.as_raw()),
            None => None,
        };
        let gid = match &config.group {
            Some(name) => Some(lookup_group(name)?.gid.as_raw()),
            None => None,
        };

        Ok(Self {
            limits,
            uid,
            gid,
            chroot: config.chroot,
        })
    }
}

fn lookup_user(name: &str) -> Result<User> {
    User::from_name(name)
        .map_err(|e| EngineError::Sandbox(format!("lookup user {}: {}", name, e)))?
        .ok_or_else(|| EngineError::Sandbox(format!("user {} does not exist", name)))
}

fn lookup_group(name: &str) -> Result<Group> {
    Group::from_name(name)
        .map_err(|e| EngineError::Sandbox(format!("lookup group {}: {}", name, e)))?
        .ok_or_else(|| EngineError::Sandbox(format!("group {} does not exist", name)))
}

impl IsolationStrategy for RlimitIsolation {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn prepare(&self, command: &mut Command, task_dir: &Path) -> Result<()> {
        let memory = self.limits.memory_bytes;
        let cpus: Vec<usize> = allowed_cpus()
            .into_iter()
            .take(self.limits.cpu_cores.unwrap_or(usize::MAX))
            .collect();
        let chroot_dir = if self.chroot {
            Some(
                CString::new(task_dir.as_os_str().as_bytes())
                    .map_err(|e| EngineError::Sandbox(format!("chroot path: {}", e)))?,
            )
        } else {
            None
        };
        let (uid, gid) = (self.uid, self.gid);

        // Only async-signal-safe calls between fork and exec. Privileges are
        // dropped last since chroot needs them.
        unsafe {
            command.pre_exec(move || {
                if let Some(bytes) = memory {
                    set_address_space_limit(bytes)?;
                }
                pin_to_cpus(&cpus)?;
                if let Some(dir) = &chroot_dir {
                    enter_chroot(dir)?;
                }
                if let Some(gid) = gid {
                    check(libc::setgid(gid))?;
                }
                if let Some(uid) = uid {
                    check(libc::setuid(uid))?;
                }
                Ok(())
            });
        }

        Ok(())
    }
}

fn check(ret: libc::c_int) -> std::io::Result<()> {
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_address_space_limit(bytes: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    check(unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) })
}

/// CPUs this process may currently run on, in index order
#[cfg(target_os = "linux")]
fn allowed_cpus() -> Vec<usize> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Vec::new();
        }
        (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect()
    }
}

#[cfg(not(target_os = "linux"))]
fn allowed_cpus() -> Vec<usize> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn pin_to_cpus(cpus: &[usize]) -> std::io::Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        check(libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set))
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpus(_cpus: &[usize]) -> std::io::Result<()> {
    Ok(())
}

fn enter_chroot(dir: &CString) -> std::io::Result<()> {
    const ROOT: &[u8] = b"/\0";
    unsafe {
        check(libc::chroot(dir.as_ptr()))?;
        check(libc::chdir(ROOT.as_ptr().cast()))
    }
}

/// Per-process cgroup v2 group (Linux only)
pub struct CgroupIsolation {
    root: PathBuf,
    limits: ResourceLimits,
}

impl CgroupIsolation {
    pub fn new(root: PathBuf, limits: ResourceLimits) -> Self {
        Self { root, limits }
    }

    fn group_path(&self, pid: u32) -> PathBuf {
        self.root.join(format!("task-{}", pid))
    }

    fn write_control(&self, group: &Path, file: &str, value: &str) {
        if let Err(e) = std::fs::write(group.join(file), value) {
            warn!("Failed to write {} in {:?}: {}", file, group, e);
        }
    }
}

impl IsolationStrategy for CgroupIsolation {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn prepare(&self, _command: &mut Command, _task_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn attach(&self, pid: u32) -> Result<()> {
        let group = self.group_path(pid);
        debug!("Placing PID {} in cgroup {:?}", pid, group);

        if let Err(e) = std::fs::create_dir_all(&group) {
            warn!("Failed to create cgroup directory: {}", e);
            return Ok(()); // Non-fatal, continue without limits
        }

        self.write_control(&group, "memory.max", &self.limits.memory_max());
        self.write_control(&group, "cpu.max", &self.limits.cpu_max());
        self.write_control(&group, "cgroup.procs", &pid.to_string());

        Ok(())
    }

    fn release(&self, pid: u32) {
        let group = self.group_path(pid);
        if group.exists() {
            if let Err(e) = std::fs::remove_dir(&group) {
                debug!("Failed to remove cgroup {:?}: {}", group, e);
            }
        }
    }
}

/// No isolation at all
pub struct NoIsolation;

impl NoIsolation {
    pub fn new() -> Self {
        warn!("Task isolation disabled; task processes run with the engine's privileges");
        Self
    }
}

impl Default for NoIsolation {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationStrategy for NoIsolation {
    fn name(&self) -> &'static str {
        "none"
    }

    fn prepare(&self, _command: &mut Command, _task_dir: &Path) -> Result<()> {
        Ok(())
    }
}
