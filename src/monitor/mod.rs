// src/monitor/mod.rs
//! OS process observation

pub mod process_manager;

pub use process_manager::{ProcessInfo, ProcessManager, ProcessSource, ProcessStats, SystemSource};
