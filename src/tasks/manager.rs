// src/tasks/manager.rs
//! Task manager
//!
//! Authoritative registry of task records. Submission registers a task as
//! `pending` and hands a [`TaskJob`] to the executor's worker pool; the job
//! drives `pending -> running -> completed|failed` and reconciles the outcome
//! back into the registry. No registry lock is held while a command runs.
//!
//! A background monitor thread ticks every `monitoring.interval`, logging task
//! counts and publishing gauges.

use crate::observability::{
    TASKS_BY_STATUS, TASKS_CANCELLED, TASKS_COMPLETED, TASKS_FAILED, TASKS_SUBMITTED,
    TASK_DURATION,
};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::worker_pool::{ExecContext, Job, PoolStats};
use crate::sandbox::executor::SandboxExecutor;
use crate::tasks::model::{Task, TaskStats, TaskStatus};
use crate::tasks::store::TaskStore;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Error text given to tasks that were live when the engine last stopped
pub const INTERRUPTED: &str = "interrupted by engine restart";

struct Shared {
    registry: RwLock<HashMap<String, Task>>,
    executor: Arc<TaskExecutor>,
    sandbox: Arc<SandboxExecutor>,
    store: Option<Arc<dyn TaskStore>>,
    submitted: AtomicU64,
    running_jobs: AtomicUsize,
}

impl Shared {
    fn persist(&self, task: &Task) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(task) {
                warn!(task_id = %task.id, "Failed to persist task: {}", e);
            }
        }
    }

    fn forget(&self, id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(id) {
                warn!(task_id = %id, "Failed to delete persisted task: {}", e);
            }
        }
    }

    fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.registry.read().values() {
            stats.count(task.status);
        }

        let pool = self.executor.pool_stats();
        stats.queue_length = pool.queued;
        stats.active_workers = pool.active;
        stats.submitted = self.submitted.load(Ordering::Relaxed);
        stats.timestamp = Utc::now();
        stats
    }
}

/// Pool job executing one task
struct TaskJob {
    id: String,
    shared: Arc<Shared>,
}

/// Decrements the running-job gauge however execution ends
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Job for TaskJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(self: Box<Self>, ctx: &ExecContext) -> Result<()> {
        let shared = &self.shared;

        let task = {
            let mut registry = shared.registry.write();
            match registry.get_mut(&self.id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.mark_running()?;
                    task.clone()
                }
                Some(task) => {
                    debug!(task_id = %self.id, status = %task.status, "Task no longer pending, skipping");
                    return Ok(());
                }
                None => {
                    debug!(task_id = %self.id, "Task deleted before it ran");
                    return Ok(());
                }
            }
        };
        shared.persist(&task);
        info!(task_id = %task.id, name = %task.name, "Task running");

        let outcome = {
            let _running = RunningGuard::enter(&shared.running_jobs);
            shared
                .sandbox
                .prepare(&task)
                .and_then(|unit| unit.run(ctx).map(|exit| (exit, unit.output_tail())))
        };

        let finished = {
            let mut registry = shared.registry.write();
            match registry.get_mut(&self.id) {
                // Only reconcile the run this job started; a cancel, update or
                // retry in the meantime owns the record now
                Some(current)
                    if current.status == TaskStatus::Running
                        && current.started_at == task.started_at =>
                {
                    match &outcome {
                        Ok((exit, tail)) if exit.success() => {
                            current.mark_completed(tail.clone(), exit.code)?
                        }
                        Ok((exit, _)) => current.mark_failed(exit.describe(), exit.code)?,
                        Err(EngineError::Cancelled) => current.mark_cancelled()?,
                        Err(EngineError::ExecutionTimeout) => current.mark_failed(
                            format!("deadline exceeded after {:?}", task_elapsed(&task)),
                            None,
                        )?,
                        Err(e) => current.mark_failed(e.to_string(), None)?,
                    }
                    Some(current.clone())
                }
                _ => None,
            }
        };

        if let Some(task) = &finished {
            shared.persist(task);
            record_terminal(task);
            match task.status {
                TaskStatus::Completed => info!(task_id = %task.id, "Task completed"),
                status => warn!(
                    task_id = %task.id,
                    status = %status,
                    error = task.error.as_deref().unwrap_or(""),
                    "Task did not complete"
                ),
            }
        }
        shared.sandbox.finish(&self.id);

        match outcome {
            Ok((exit, _)) if exit.success() => Ok(()),
            Ok((exit, _)) => Err(EngineError::ExecutionFailed(exit.describe())),
            Err(e) => Err(e),
        }
    }
}

fn task_elapsed(task: &Task) -> Duration {
    task.started_at
        .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
        .unwrap_or_default()
}

fn record_terminal(task: &Task) {
    let name = match task.status {
        TaskStatus::Completed => TASKS_COMPLETED,
        TaskStatus::Failed => TASKS_FAILED,
        TaskStatus::Cancelled => TASKS_CANCELLED,
        _ => return,
    };
    metrics::counter!(name).increment(1);
    if let Some(ms) = task.duration_ms {
        metrics::histogram!(TASK_DURATION).record(ms as f64 / 1000.0);
    }
}

struct Monitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TaskManager {
    shared: Arc<Shared>,
    accepting: AtomicBool,
    interval: RwLock<Duration>,
    monitor: Mutex<Option<Monitor>>,
}

impl TaskManager {
    pub fn new(
        executor: Arc<TaskExecutor>,
        sandbox: Arc<SandboxExecutor>,
        store: Option<Arc<dyn TaskStore>>,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(HashMap::new()),
                executor,
                sandbox,
                store,
                submitted: AtomicU64::new(0),
                running_jobs: AtomicUsize::new(0),
            }),
            accepting: AtomicBool::new(true),
            interval: RwLock::new(monitor_interval),
            monitor: Mutex::new(None),
        }
    }

    /// Register `task` as pending and queue it for execution.
    ///
    /// Blocks while the worker pool queue is full. A task whose ID is
    /// already registered is left untouched.
    pub fn submit_task(&self, mut task: Task) -> Result<String> {
        if !self.is_accepting() {
            return Err(EngineError::SubmissionsClosed);
        }
        task.validate()?;

        task.status = TaskStatus::Pending;
        task.progress = 0.0;
        task.started_at = None;
        task.finished_at = None;
        task.duration_ms = None;
        task.error = None;
        task.result = None;
        task.exit_code = None;

        let id = task.id.clone();
        {
            let mut registry = self.shared.registry.write();
            if registry.contains_key(&id) {
                debug!(task_id = %id, "Task already registered");
                return Ok(id);
            }
            registry.insert(id.clone(), task.clone());
        }

        self.shared.persist(&task);
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(TASKS_SUBMITTED).increment(1);
        info!(task_id = %id, name = %task.name, command = %task.command, "Task submitted");

        self.enqueue(&id)?;
        Ok(id)
    }

    /// Queue an existing pending task, e.g. after [`retry_task`](Self::retry_task)
    pub fn resubmit_task(&self, id: &str) -> Result<()> {
        if !self.is_accepting() {
            return Err(EngineError::SubmissionsClosed);
        }

        let status = self.get_task(id)?.status;
        if status != TaskStatus::Pending {
            return Err(EngineError::InvalidArgument(format!(
                "task {} is {}; only pending tasks can be resubmitted",
                id, status
            )));
        }

        self.enqueue(id)?;
        info!(task_id = %id, "Task resubmitted");
        Ok(())
    }

    fn enqueue(&self, id: &str) -> Result<()> {
        let job = TaskJob {
            id: id.to_string(),
            shared: Arc::clone(&self.shared),
        };
        self.shared.executor.submit(Box::new(job)).map_err(|e| {
            warn!(task_id = %id, "Task left pending, could not be queued: {}", e);
            e
        })
    }

    /// Cancel a pending or running task; a terminal task is left as is
    pub fn cancel_task(&self, id: &str) -> Result<()> {
        let cancelled = {
            let mut registry = self.shared.registry.write();
            let task = registry
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

            if task.status.is_terminal() {
                debug!(task_id = %id, status = %task.status, "Cancel ignored for finished task");
                return Ok(());
            }

            let was = task.status;
            task.mark_cancelled()?;
            (task.clone(), was)
        };

        let (task, was) = cancelled;
        self.shared.persist(&task);
        record_terminal(&task);
        self.shared.executor.cancel_task(id);
        if was == TaskStatus::Pending {
            self.shared.sandbox.finish(id);
        }

        info!(task_id = %id, previous = %was, "Task cancelled");
        Ok(())
    }

    /// Put a finished task back to pending. Never resubmits.
    pub fn retry_task(&self, id: &str) -> Result<()> {
        let task = {
            let mut registry = self.shared.registry.write();
            let task = registry
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

            match task.status {
                TaskStatus::Pending => return Ok(()),
                TaskStatus::Running => {
                    return Err(EngineError::InvalidTransition {
                        id: id.to_string(),
                        from: TaskStatus::Running.to_string(),
                        to: TaskStatus::Pending.to_string(),
                    })
                }
                _ => {
                    task.reset_for_retry()?;
                    task.clone()
                }
            }
        };

        self.shared.persist(&task);
        info!(task_id = %id, "Task reset for retry");
        Ok(())
    }

    /// Replace a task's editable fields; a status change must be a legal edge.
    ///
    /// Run timestamps and exit code stay with the record, and only a worker
    /// moves a task to `running`. A live task moved to a terminal status has
    /// its job cancelled.
    pub fn update_task(&self, id: &str, mut task: Task) -> Result<()> {
        task.id = id.to_string();
        task.validate()?;

        let (was, updated) = {
            let mut registry = self.shared.registry.write();
            let current = registry
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

            let was = current.status;
            current.apply_update(task)?;
            (was, current.clone())
        };
        let now = updated.status;

        self.shared.persist(&updated);
        if was != now && now.is_terminal() {
            record_terminal(&updated);
            self.shared.executor.cancel_task(id);
            if was == TaskStatus::Pending {
                self.shared.sandbox.finish(id);
            }
        }

        debug!(task_id = %id, from = %was, to = %now, "Task updated");
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let removed = self
            .shared
            .registry
            .write()
            .remove(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        if removed.status.is_terminal() {
            self.shared.sandbox.finish(id);
        } else {
            self.shared.executor.cancel_task(id);
        }
        self.shared.forget(id);

        info!(task_id = %id, status = %removed.status, "Task deleted");
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.shared
            .registry
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// All tasks, oldest first
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.shared.registry.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn get_task_stats(&self) -> TaskStats {
        self.shared.stats()
    }

    pub fn get_thread_pool_stats(&self) -> PoolStats {
        self.shared.executor.pool_stats()
    }

    /// Number of task commands executing right now
    pub fn running_jobs(&self) -> usize {
        self.shared.running_jobs.load(Ordering::SeqCst)
    }

    /// Tasks that are pending or running
    pub fn live_count(&self) -> usize {
        self.shared
            .registry
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// One telemetry tick: log counts, publish gauges, return the snapshot
    pub fn monitor_tasks(&self) -> TaskStats {
        monitor_tick(&self.shared)
    }

    /// Cancel every pending and running task; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let cancelled: Vec<Task> = {
            let mut registry = self.shared.registry.write();
            registry
                .values_mut()
                .filter(|t| !t.status.is_terminal())
                .filter_map(|t| t.mark_cancelled().ok().map(|()| t.clone()))
                .collect()
        };

        for task in &cancelled {
            self.shared.persist(task);
            record_terminal(task);
        }
        self.shared.executor.cancel_all();

        if !cancelled.is_empty() {
            warn!("Cancelled {} live tasks", cancelled.len());
        }
        cancelled.len()
    }

    /// Block until no task is pending or running, or `timeout` passes.
    ///
    /// Returns whether the registry went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let live = self.live_count();
            if live == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("{} tasks still live after waiting {:?}", live, timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Load records from another run; anything that was live becomes failed
    pub fn restore(&self, tasks: Vec<Task>) -> usize {
        let mut restored = Vec::new();
        {
            let mut registry = self.shared.registry.write();
            for mut task in tasks {
                if registry.contains_key(&task.id) {
                    continue;
                }
                if !task.status.is_terminal() {
                    let now: DateTime<Utc> = Utc::now();
                    task.status = TaskStatus::Failed;
                    task.error = Some(INTERRUPTED.to_string());
                    task.finished_at = Some(now);
                    restored.push(task.clone());
                }
                registry.insert(task.id.clone(), task);
            }
        }

        for task in &restored {
            self.shared.persist(task);
        }

        let total = self.shared.registry.read().len();
        info!(
            total,
            interrupted = restored.len(),
            "Task registry restored"
        );
        restored.len()
    }

    /// Hydrate the registry from the configured store
    pub fn restore_from_store(&self) -> Result<usize> {
        match &self.shared.store {
            Some(store) => {
                let tasks = store.load_all()?;
                Ok(self.restore(tasks))
            }
            None => Ok(0),
        }
    }

    pub fn flush_store(&self) -> Result<()> {
        match &self.shared.store {
            Some(store) => store.flush(),
            None => Ok(()),
        }
    }

    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Task submissions paused");
        }
    }

    pub fn resume_accepting(&self) {
        if !self.accepting.swap(true, Ordering::SeqCst) {
            info!("Task submissions resumed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn monitor_interval(&self) -> Duration {
        *self.interval.read()
    }

    /// Takes effect the next time the monitor is started
    pub fn set_monitor_interval(&self, interval: Duration) {
        *self.interval.write() = interval;
    }

    /// Start the monitor loop. A second call while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            debug!("Task monitor already running");
            return Ok(());
        }

        let interval = self.monitor_interval();
        let shared = Arc::clone(&self.shared);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("taskflow-task-monitor".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            monitor_tick(&shared);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Task monitor exiting");
            })
            .map_err(|e| EngineError::RuntimeError(format!("failed to spawn task monitor: {}", e)))?;

        *monitor = Some(Monitor {
            stop: stop_tx,
            handle,
        });
        info!(interval = ?interval, "Task monitor started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let Some(monitor) = self.monitor.lock().take() else {
            debug!("Task monitor already stopped");
            return Ok(());
        };

        let _ = monitor.stop.send(());
        if monitor.handle.join().is_err() {
            warn!("Task monitor thread panicked");
        }
        info!("Task monitor stopped");
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn monitor_tick(shared: &Shared) -> TaskStats {
    let stats = shared.stats();

    for status in TaskStatus::ALL {
        let count = match status {
            TaskStatus::Pending => stats.pending,
            TaskStatus::Running => stats.active,
            TaskStatus::Completed => stats.completed,
            TaskStatus::Failed => stats.failed,
            TaskStatus::Cancelled => stats.cancelled,
        };
        metrics::gauge!(TASKS_BY_STATUS, "status" => status.as_str()).set(count as f64);
    }

    info!(
        total = stats.total,
        pending = stats.pending,
        running = stats.active,
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        queued = stats.queue_length,
        active_workers = stats.active_workers,
        "Task monitor"
    );
    stats
}
