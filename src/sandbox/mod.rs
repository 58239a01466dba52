// src/sandbox/mod.rs
//! Isolated task execution
//!
//! - **Executor**: per-task directories and execution units
//! - **Environment**: registry of installed language runtimes
//! - **Isolation**: pluggable strategies applied to task processes
//! - **Resource Limits**: memory and CPU ceilings the strategies enforce

pub mod environment;
pub mod executor;
pub mod isolation;
pub mod resource_limits;

pub use environment::{EnvironmentManager, EnvironmentRecord, RuntimeKind};
pub use executor::{ExecutionUnit, SandboxExecutor};
pub use isolation::{build_strategy, IsolationStrategy};
pub use resource_limits::ResourceLimits;
