// src/utils/mod.rs
//! Shared utilities: error type, configuration, unit parsing

pub mod config;
pub mod errors;
pub mod units;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
