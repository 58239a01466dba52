// src/runtime/mod.rs
//! Execution runtime
//!
//! - **Worker Pool**: fixed set of worker threads draining a bounded queue
//! - **Executor**: owns the current pool and rebuilds it on restart
//! - **Process**: child process supervision with deadline and cancellation
//!
//! # Architecture
//!
//! ```text
//!  submit ──► bounded queue ──► worker 0..N ──► Job::execute
//!                                   │
//!                                   ├─ ExecContext (deadline, cancel token)
//!                                   └─ supervise(child) ─► killpg on expiry
//! ```

pub mod executor;
pub mod process;
pub mod worker_pool;

pub use executor::{ExecutorStatus, TaskExecutor};
pub use process::{CommandSpec, ProcessExit};
pub use worker_pool::{ExecContext, Job, PoolStats, WorkerPool, WorkerPoolConfig};
