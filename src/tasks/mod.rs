// src/tasks/mod.rs
//! Task records and their lifecycle
//!
//! - **Model**: the task record and its status state machine
//! - **Manager**: registry, submission, cancellation, retry, monitoring
//! - **Store**: SQLite mirror so records survive a restart

pub mod manager;
pub mod model;
pub mod store;

pub use manager::TaskManager;
pub use model::{RuntimeRequirement, Task, TaskStats, TaskStatus};
pub use store::{SqliteTaskStore, TaskStore};
