// src/runtime/worker_pool.rs
//! Fixed-size worker pool over a bounded job queue
//!
//! `max_workers` OS threads pull jobs from a bounded crossbeam channel of
//! capacity `max_queue`. A full queue blocks `submit` (backpressure) rather
//! than dropping work.
//!
//! # Architecture
//!
//! ```text
//! submit ──► [ bounded queue (max_queue) ] ──► worker-0 ─┐
//!                                          ├─► worker-1 ─┼─► Job::execute(ctx)
//!                                          └─► worker-N ─┘
//! ```
//!
//! Every job carries a [`CancellationToken`] registered under its ID. A job
//! cancelled while still queued is skipped when dequeued; a running job sees
//! the token through its [`ExecContext`].

use crate::observability::{POOL_ACTIVE, POOL_QUEUED};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unit of work executed by a pool worker
pub trait Job: Send + 'static {
    /// Key used for cancellation lookups
    fn id(&self) -> &str;

    /// Run to completion, honoring `ctx` deadline and cancellation
    fn execute(self: Box<Self>, ctx: &ExecContext) -> Result<()>;
}

/// Per-execution context handed to a running job
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub task_id: String,
    pub deadline: Instant,
    pub token: CancellationToken,
}

impl ExecContext {
    pub fn new(task_id: impl Into<String>, timeout: Duration, token: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            deadline: Instant::now() + timeout,
            token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before the deadline (zero once expired)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub max_workers: usize,

    /// Queue capacity before submitters block
    pub max_queue: usize,

    /// Deadline applied to every job from the moment it starts
    pub task_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue: 100,
            task_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_engine(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            max_workers: config.threadpool.max_workers,
            max_queue: config.threadpool.max_queue,
            task_timeout: config.task_timeout()?,
        })
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Executions started
    pub total: u64,
    /// Executions in flight
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    /// Jobs dropped at dequeue because they were cancelled while queued
    pub skipped: u64,
    /// Jobs waiting in the queue
    pub queued: usize,
    pub max_workers: usize,
    pub max_queue: usize,
    pub running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    active: u64,
    completed: u64,
    failed: u64,
    skipped: u64,
}

struct TokenEntry {
    seq: u64,
    token: CancellationToken,
}

struct QueuedJob {
    seq: u64,
    job: Box<dyn Job>,
    token: CancellationToken,
}

struct Shared {
    counters: Mutex<Counters>,
    tokens: DashMap<String, TokenEntry>,
    next_seq: AtomicU64,
}

impl Shared {
    fn release_token(&self, id: &str, seq: u64) {
        self.tokens.remove_if(id, |_, entry| entry.seq == seq);
    }
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Arc<Shared>,
    sender: RwLock<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPool {
    /// Create a stopped pool; no threads are spawned until [`start`](Self::start)
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        if config.max_workers == 0 {
            return Err(EngineError::InvalidArgument(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        if config.max_queue == 0 {
            return Err(EngineError::InvalidArgument(
                "max_queue must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                counters: Mutex::new(Counters::default()),
                tokens: DashMap::new(),
                next_seq: AtomicU64::new(1),
            }),
            sender: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawn the workers. A second call while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.running.load(Ordering::SeqCst) {
            info!("Worker pool already running");
            return Ok(());
        }

        let (sender, receiver) = bounded::<QueuedJob>(self.config.max_queue);

        for index in 0..self.config.max_workers {
            let receiver = receiver.clone();
            let shared = Arc::clone(&self.shared);
            let timeout = self.config.task_timeout;

            let spawned = thread::Builder::new()
                .name(format!("taskflow-worker-{}", index))
                .spawn(move || worker_loop(index, receiver, shared, timeout));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Closing the channel lets already-spawned workers exit
                    drop(sender);
                    for handle in workers.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(EngineError::RuntimeError(format!(
                        "failed to spawn worker {}: {}",
                        index, e
                    )));
                }
            }
        }

        *self.sender.write() = Some(sender);
        self.running.store(true, Ordering::SeqCst);

        info!(
            max_workers = self.config.max_workers,
            max_queue = self.config.max_queue,
            "Worker pool started"
        );
        Ok(())
    }

    /// Queue a job, blocking while the queue is full
    pub fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        // Clone out so the lock is not held while blocked on a full queue
        let sender = self.sender.read().clone().ok_or(EngineError::PoolStopped)?;

        let id = job.id().to_string();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.shared.tokens.insert(
            id.clone(),
            TokenEntry {
                seq,
                token: token.clone(),
            },
        );

        if sender.send(QueuedJob { seq, job, token }).is_err() {
            self.shared.release_token(&id, seq);
            return Err(EngineError::PoolStopped);
        }

        metrics::gauge!(POOL_QUEUED).set(sender.len() as f64);
        debug!(task_id = %id, "Job queued");
        Ok(())
    }

    /// Close the queue and wait for workers to drain it and exit
    pub fn stop(&self) -> Result<()> {
        let handles = {
            let mut workers = self.workers.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                debug!("Worker pool already stopped");
                return Ok(());
            }
            self.sender.write().take();
            std::mem::take(&mut *workers)
        };

        info!("Stopping worker pool, draining queued jobs");

        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            warn!("{} worker threads panicked", panicked);
        }

        info!("Worker pool stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel a queued or running job. Returns whether a live job was found.
    pub fn cancel_task(&self, id: &str) -> bool {
        match self.shared.tokens.get(id) {
            Some(entry) => {
                entry.token.cancel();
                debug!(task_id = %id, "Job cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every queued and running job; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.shared.tokens.iter() {
            entry.token.cancel();
            count += 1;
        }
        if count > 0 {
            info!("Cancelled {} pool jobs", count);
        }
        count
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let queued = self.sender.read().as_ref().map(|s| s.len()).unwrap_or(0);
        let counters = self.shared.counters.lock();

        PoolStats {
            total: counters.total,
            active: counters.active,
            completed: counters.completed,
            failed: counters.failed,
            skipped: counters.skipped,
            queued,
            max_workers: self.config.max_workers,
            max_queue: self.config.max_queue,
            running: self.is_running(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn worker_loop(
    index: usize,
    receiver: Receiver<QueuedJob>,
    shared: Arc<Shared>,
    timeout: Duration,
) {
    debug!(worker = index, "Worker started");

    while let Ok(QueuedJob { seq, job, token }) = receiver.recv() {
        let id = job.id().to_string();
        metrics::gauge!(POOL_QUEUED).set(receiver.len() as f64);

        if token.is_cancelled() {
            shared.counters.lock().skipped += 1;
            shared.release_token(&id, seq);
            debug!(worker = index, task_id = %id, "Skipping job cancelled while queued");
            continue;
        }

        {
            let mut counters = shared.counters.lock();
            counters.total += 1;
            counters.active += 1;
            metrics::gauge!(POOL_ACTIVE).set(counters.active as f64);
        }

        let ctx = ExecContext::new(id.clone(), timeout, token);
        let outcome = catch_unwind(AssertUnwindSafe(|| job.execute(&ctx)));

        let succeeded = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(worker = index, task_id = %id, error = %e, "Job failed");
                false
            }
            Err(_) => {
                error!(worker = index, task_id = %id, "Job panicked");
                false
            }
        };

        {
            let mut counters = shared.counters.lock();
            counters.active -= 1;
            if succeeded {
                counters.completed += 1;
            } else {
                counters.failed += 1;
            }
            metrics::gauge!(POOL_ACTIVE).set(counters.active as f64);
        }

        shared.release_token(&id, seq);
    }

    debug!(worker = index, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FnJob<F> {
        id: String,
        f: F,
    }

    impl<F> Job for FnJob<F>
    where
        F: FnOnce(&ExecContext) -> Result<()> + Send + 'static,
    {
        fn id(&self) -> &str {
            &self.id
        }

        fn execute(self: Box<Self>, ctx: &ExecContext) -> Result<()> {
            (self.f)(ctx)
        }
    }

    fn job<F>(id: &str, f: F) -> Box<dyn Job>
    where
        F: FnOnce(&ExecContext) -> Result<()> + Send + 'static,
    {
        Box::new(FnJob { id: id.to_string(), f })
    }

    fn pool(max_workers: usize, max_queue: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            max_workers,
            max_queue,
            task_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerPool::new(WorkerPoolConfig {
            max_workers: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));

        let result = WorkerPool::new(WorkerPoolConfig {
            max_queue: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_submit_requires_running_pool() {
        let pool = pool(1, 4);
        let result = pool.submit(job("a", |_| Ok(())));
        assert!(matches!(result, Err(EngineError::PoolStopped)));
    }

    #[test]
    fn test_counters_after_drain() {
        let pool = pool(2, 8);
        pool.start().unwrap();

        for i in 0..6 {
            let fail = i % 3 == 0;
            pool.submit(job(&format!("j{}", i), move |_| {
                if fail {
                    Err(EngineError::ExecutionFailed("boom".into()))
                } else {
                    Ok(())
                }
            }))
            .unwrap();
        }

        pool.stop().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.total, stats.active + stats.completed + stats.failed);
        assert!(!stats.running);
    }

    #[test]
    fn test_concurrency_bounded_by_max_workers() {
        let pool = pool(3, 32);
        pool.start().unwrap();

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.submit(job(&format!("j{}", i), move |_| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }

        pool.stop().unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().completed, 12);
    }

    #[test]
    fn test_cancel_queued_job_is_skipped() {
        let pool = pool(1, 4);
        pool.start().unwrap();

        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        pool.submit(job("blocker", move |_| {
            let _ = release_rx.recv();
            Ok(())
        }))
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.submit(job("queued", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        assert!(pool.cancel_task("queued"));
        release_tx.send(()).unwrap();
        pool.stop().unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        let stats = pool.stats();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 1);
        assert!(!pool.cancel_task("queued"));
    }

    #[test]
    fn test_running_job_sees_cancellation() {
        let pool = pool(1, 4);
        pool.start().unwrap();

        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        pool.submit(job("long", move |ctx| {
            let _ = started_tx.send(());
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(EngineError::Cancelled)
        }))
        .unwrap();

        started_rx.recv().unwrap();
        assert!(pool.cancel_task("long"));
        pool.stop().unwrap();
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn test_panicking_job_counts_as_failed() {
        let pool = pool(1, 4);
        pool.start().unwrap();
        pool.submit(job("panics", |_| panic!("job blew up"))).unwrap();
        pool.submit(job("fine", |_| Ok(()))).unwrap();
        pool.stop().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_start_stop_idempotent_and_restartable() {
        let pool = pool(2, 4);
        pool.start().unwrap();
        pool.start().unwrap();
        pool.stop().unwrap();
        pool.stop().unwrap();

        pool.start().unwrap();
        pool.submit(job("again", |_| Ok(()))).unwrap();
        pool.stop().unwrap();
        assert_eq!(pool.stats().completed, 1);
    }
}
