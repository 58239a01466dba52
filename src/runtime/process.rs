// src/runtime/process.rs
//! Spawning and supervising task processes
//!
//! Every task command runs as the leader of its own process group so that a
//! deadline or cancellation can take down the whole tree it forked. Waiting
//! is a `try_wait` poll that also watches the job's [`ExecContext`].

use crate::runtime::worker_pool::ExecContext;
use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a supervised child is polled
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Everything needed to launch one task command
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute, resolved through `PATH` when not absolute
    pub program: String,

    /// Arguments passed verbatim
    pub args: Vec<String>,

    /// Working directory of the child
    pub cwd: PathBuf,

    /// Extra environment entries layered over the inherited environment
    pub env: Vec<(String, String)>,

    /// Files receiving stdout/stderr; discarded when unset
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            stdout: None,
            stderr: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build a `Command` in a fresh process group with stdio redirected
    pub fn to_command(&self) -> Result<Command> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .process_group(0);

        for (key, value) in &self.env {
            command.env(key, value);
        }

        command.stdout(redirect(self.stdout.as_ref())?);
        command.stderr(redirect(self.stderr.as_ref())?);

        Ok(command)
    }
}

fn redirect(path: Option<&PathBuf>) -> Result<Stdio> {
    match path {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                EngineError::ProcessSpawnFailed(format!("open {}: {}", path.display(), e))
            })?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
}

impl ProcessExit {
    fn from_status(pid: u32, status: ExitStatus, elapsed: Duration) -> Self {
        Self {
            pid,
            code: status.code(),
            signal: status.signal(),
            elapsed,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description used as task error text
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Wait for `child`, killing its process group on deadline or cancellation.
///
/// Returns the exit on natural termination, `ExecutionTimeout` when the
/// deadline passed, and `Cancelled` when the token fired.
pub fn supervise(child: &mut Child, ctx: &ExecContext, grace: Duration) -> Result<ProcessExit> {
    let pid = child.id();
    let started = Instant::now();

    loop {
        let polled = match child.try_wait() {
            Ok(polled) => polled,
            Err(e) => {
                warn!(
                    task_id = %ctx.task_id,
                    pid,
                    "Waiting on process failed, killing process group: {}",
                    e
                );
                kill_group_now(child);
                return Err(e.into());
            }
        };

        if let Some(status) = polled {
            let exit = ProcessExit::from_status(pid, status, started.elapsed());
            debug!(task_id = %ctx.task_id, pid, status = %exit.describe(), "Process exited");
            return Ok(exit);
        }

        if ctx.is_cancelled() {
            debug!(task_id = %ctx.task_id, pid, "Cancellation requested, terminating process group");
            terminate_group(child, grace)?;
            return Err(EngineError::Cancelled);
        }

        if ctx.is_expired() {
            warn!(task_id = %ctx.task_id, pid, "Deadline exceeded, terminating process group");
            terminate_group(child, grace)?;
            return Err(EngineError::ExecutionTimeout);
        }

        thread::sleep(POLL_INTERVAL.min(ctx.remaining().max(Duration::from_millis(1))));
    }
}

/// SIGTERM the child's process group, then SIGKILL after `grace`.
///
/// The child is reaped before returning.
pub fn terminate_group(child: &mut Child, grace: Duration) -> Result<()> {
    let pgid = Pid::from_raw(child.id() as i32);

    debug!("Sending SIGTERM to process group {}", pgid);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        // ESRCH: the group is already gone
        debug!("SIGTERM to process group {} failed: {}", pgid, e);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            // Leader exited; stragglers in the group still get the KILL below
            let _ = killpg(pgid, Signal::SIGKILL);
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    debug!("Process group {} still alive, sending SIGKILL", pgid);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("SIGKILL to process group {} failed: {}", pgid, e);
    }
    child.wait()?;
    Ok(())
}

/// SIGKILL the child's process group and reap the child, ignoring errors
fn kill_group_now(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("SIGKILL to process group {} failed: {}", pgid, e);
    }
    let _ = child.wait();
}

/// SIGTERM an arbitrary PID, then SIGKILL if it is still alive after `grace`.
///
/// Returns `false` when the process did not exist.
pub fn terminate_pid(pid: u32, grace: Duration) -> Result<bool> {
    let pid = Pid::from_raw(pid as i32);

    if !is_alive(pid) {
        return Ok(false);
    }

    debug!("Sending SIGTERM to PID {}", pid);
    kill(pid, Signal::SIGTERM)
        .map_err(|e| EngineError::RuntimeError(format!("Failed to send SIGTERM: {}", e)))?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return Ok(true);
        }
        thread::sleep(POLL_INTERVAL);
    }

    if is_alive(pid) {
        debug!("Process still alive, sending SIGKILL to PID {}", pid);
        kill(pid, Signal::SIGKILL)
            .map_err(|e| EngineError::RuntimeError(format!("Failed to send SIGKILL: {}", e)))?;
    }

    Ok(true)
}

/// Check if a process is running
pub fn is_running(pid: u32) -> bool {
    is_alive(Pid::from_raw(pid as i32))
}

fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}
