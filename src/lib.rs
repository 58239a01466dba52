// src/lib.rs
//! Taskflow Engine Library
//!
//! Runs user-submitted commands on a bounded pool of worker threads, each in
//! its own sandboxed working directory, and coordinates ordered startup,
//! restart, and shutdown across the components that depend on each other.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: worker pool, task executor, child process supervision
//! - **sandbox**: task directories, language runtimes, isolation strategies
//! - **tasks**: task records, state machine, registry, durable store
//! - **monitor**: OS process snapshots
//! - **lifecycle**: service composition root, restart and shutdown
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration, errors, unit parsing

pub mod lifecycle;
pub mod monitor;
pub mod observability;
pub mod runtime;
pub mod sandbox;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use lifecycle::{LifecyclePhase, RestartManager, Service, ShutdownManager, ShutdownReport};
pub use runtime::worker_pool::{WorkerPool, WorkerPoolConfig};
pub use tasks::model::{Task, TaskStatus};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
