// src/utils/errors.rs
//! Engine error type
//!
//! Errors fall into a few families that callers treat differently:
//!
//! - **Validation**: rejected synchronously at the call boundary
//! - **Not found**: unknown task, environment, or version
//! - **Execution**: a task's command failed or its deadline lapsed; recorded on
//!   the task record and never raised process-wide
//! - **Lifecycle**: a second restart/shutdown while one is in progress

use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("{kind} environment version {version} not found")]
    EnvironmentNotFound { kind: String, version: String },

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("task submissions are not being accepted")]
    SubmissionsClosed,

    #[error("worker pool is not running")]
    PoolStopped,

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("command exited unsuccessfully: {0}")]
    ExecutionFailed(String),

    #[error("execution timed out")]
    ExecutionTimeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("{0} already in progress")]
    LifecycleConflict(&'static str),

    #[error("invalid lifecycle state: {0}")]
    InvalidLifecycleState(String),

    #[error("restart failed: {0}")]
    RestartFailed(String),

    #[error("storage error: {0}")]
    StorageFailed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for the not-found family
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::TaskNotFound(_)
                | EngineError::ProcessNotFound(_)
                | EngineError::EnvironmentNotFound { .. }
        )
    }

    /// True for errors produced by a task's own execution
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            EngineError::ExecutionFailed(_)
                | EngineError::ExecutionTimeout
                | EngineError::Cancelled
                | EngineError::ProcessSpawnFailed(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StorageFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_conflict_message() {
        let err = EngineError::LifecycleConflict("restart");
        assert_eq!(err.to_string(), "restart already in progress");
    }

    #[test]
    fn test_classification() {
        assert!(EngineError::TaskNotFound("t1".into()).is_not_found());
        assert!(EngineError::ProcessNotFound(42).is_not_found());
        assert!(!EngineError::PoolStopped.is_not_found());
        assert!(EngineError::ExecutionTimeout.is_execution());
        assert!(!EngineError::InvalidArgument("x".into()).is_execution());
    }
}
