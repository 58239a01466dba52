// src/tasks/model.rs
//! Task record and its state machine
//!
//! ```text
//! pending ──► running ──► completed
//!    │           ├──────► failed
//!    │           └──────► cancelled
//!    └──────────────────► cancelled
//! completed | failed | cancelled ──► pending   (retry)
//! ```

use crate::sandbox::environment::RuntimeKind;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Completed, Pending)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown task status '{}'", s)))
    }
}

/// Language runtime a task must run under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRequirement {
    pub kind: RuntimeKind,
    pub version: String,
}

/// A unit of user-submitted work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID (ULID)
    pub id: String,

    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub assignee: String,

    /// Program to run
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,

    /// Overrides the sandbox task directory as the working directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Where the task writes its results, if it declares one
    #[serde(default)]
    pub result_path: Option<String>,

    #[serde(default)]
    pub runtime: Option<RuntimeRequirement>,

    pub status: TaskStatus,

    /// Percentage in `0.0..=100.0`
    #[serde(default)]
    pub progress: f64,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.into(),
            description: String::new(),
            creator: String::new(),
            assignee: String::new(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            result_path: None,
            runtime: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
            result: None,
            exit_code: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = assignee.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_runtime(mut self, kind: RuntimeKind, version: impl Into<String>) -> Self {
        self.runtime = Some(RuntimeRequirement {
            kind,
            version: version.into(),
        });
        self
    }

    /// Reject records that can never run
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidArgument("task id is empty".to_string()));
        }
        if self.id.contains(std::path::is_separator) || self.id.starts_with('.') {
            return Err(EngineError::InvalidArgument(format!(
                "task id '{}' is not a valid directory name",
                self.id
            )));
        }
        if self.command.trim().is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "task {} has no command",
                self.id
            )));
        }
        if !(0.0..=100.0).contains(&self.progress) {
            return Err(EngineError::InvalidArgument(format!(
                "task {} progress {} is outside 0-100",
                self.id, self.progress
            )));
        }
        Ok(())
    }

    fn check_transition(&self, next: TaskStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// `pending -> running`
    pub fn mark_running(&mut self) -> Result<()> {
        self.check_transition(TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> completed`
    pub fn mark_completed(&mut self, result: Option<String>, exit_code: Option<i32>) -> Result<()> {
        self.check_transition(TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.progress = 100.0;
        self.result = result;
        self.exit_code = exit_code;
        self.finish();
        Ok(())
    }

    /// `running -> failed`
    pub fn mark_failed(&mut self, error: impl Into<String>, exit_code: Option<i32>) -> Result<()> {
        self.check_transition(TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.exit_code = exit_code;
        self.finish();
        Ok(())
    }

    /// `pending|running -> cancelled`
    pub fn mark_cancelled(&mut self) -> Result<()> {
        self.check_transition(TaskStatus::Cancelled)?;
        self.status = TaskStatus::Cancelled;
        self.finish();
        Ok(())
    }

    /// `terminal -> pending`, clearing everything a run produced
    pub fn reset_for_retry(&mut self) -> Result<()> {
        self.check_transition(TaskStatus::Pending)?;
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.started_at = None;
        self.finished_at = None;
        self.duration_ms = None;
        self.error = None;
        self.result = None;
        self.exit_code = None;
        Ok(())
    }

    fn finish(&mut self) {
        let now = Utc::now();
        let from = self.started_at.unwrap_or(self.created_at);
        self.finished_at = Some(now);
        self.duration_ms = Some((now - from).num_milliseconds().max(0) as u64);
    }

    /// Replace the caller-editable fields with those of `next` and take the
    /// status edge it asks for.
    ///
    /// Fields a run produces (`started_at`, `finished_at`, `duration_ms`,
    /// `exit_code`) stay with the record, and `running` is only entered by a
    /// worker. On error `self` is unchanged.
    pub fn apply_update(&mut self, next: Task) -> Result<()> {
        let target = next.status;
        if target != self.status {
            self.check_transition(target)?;
        }

        let mut updated = self.clone();
        updated.name = next.name;
        updated.description = next.description;
        updated.creator = next.creator;
        updated.assignee = next.assignee;
        updated.command = next.command;
        updated.args = next.args;
        updated.working_dir = next.working_dir;
        updated.result_path = next.result_path;
        updated.runtime = next.runtime;
        updated.progress = next.progress;

        match target {
            _ if target == self.status => {}
            TaskStatus::Running => {
                return Err(EngineError::InvalidArgument(format!(
                    "task {} can only start running from a worker",
                    self.id
                )))
            }
            TaskStatus::Pending => updated.reset_for_retry()?,
            TaskStatus::Completed => {
                let exit_code = updated.exit_code;
                updated.mark_completed(next.result, exit_code)?
            }
            TaskStatus::Failed => {
                let exit_code = updated.exit_code;
                let error = next.error.unwrap_or_else(|| "failed by update".to_string());
                updated.mark_failed(error, exit_code)?
            }
            TaskStatus::Cancelled => updated.mark_cancelled()?,
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Point-in-time task counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    /// Tasks in `running`
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs waiting in the worker pool queue
    pub queue_length: usize,
    /// Workers currently executing a job
    pub active_workers: u64,
    /// Tasks accepted since the manager was created
    pub submitted: u64,
    pub timestamp: DateTime<Utc>,
}

impl TaskStats {
    pub fn count(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.active += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("build", "make").with_args(["all"]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.args, vec!["all".to_string()]);
        assert!(task.validate().is_ok());
        assert_ne!(task.id, Task::new("build", "make").id);
    }

    #[test]
    fn test_validate() {
        let mut task = Task::new("x", "");
        assert!(task.validate().is_err());

        task.command = "true".to_string();
        task.id = "../escape".to_string();
        assert!(task.validate().is_err());

        task.id = "ok".to_string();
        task.progress = 140.0;
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_happy_path_timestamps() {
        let mut task = Task::new("t", "true");
        task.mark_running().unwrap();
        assert!(task.started_at.is_some());

        task.mark_completed(Some("ok".into()), Some(0)).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
        assert!(task.finished_at.is_some());
        assert!(task.duration_ms.is_some());
    }

    #[test]
    fn test_illegal_edges() {
        let mut task = Task::new("t", "true");
        assert!(matches!(
            task.mark_completed(None, None),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(task.reset_for_retry().is_err());

        task.mark_cancelled().unwrap();
        assert!(task.mark_running().is_err());
        assert!(task.mark_cancelled().is_err());
    }

    #[test]
    fn test_retry_clears_run_fields() {
        let mut task = Task::new("t", "false");
        task.mark_running().unwrap();
        task.progress = 40.0;
        task.mark_failed("exit code 1", Some(1)).unwrap();

        task.reset_for_retry().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.error.is_none());
        assert!(task.exit_code.is_none());
        assert!(task.started_at.is_none());
        assert!(task.finished_at.is_none());
        assert!(task.duration_ms.is_none());
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(serde_json::to_string(&TaskStatus::Cancelled).unwrap(), "\"cancelled\"");
    }

    #[test]
    fn test_update_keeps_run_fields() {
        let mut task = Task::new("t", "sleep");
        task.mark_running().unwrap();
        let started = task.started_at;

        let mut edited = task.clone();
        edited.description = "edited".to_string();
        edited.started_at = None;
        edited.exit_code = Some(9);
        task.apply_update(edited).unwrap();

        assert_eq!(task.description, "edited");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.started_at, started);
        assert!(task.exit_code.is_none());
    }

    #[test]
    fn test_update_never_enters_running() {
        let mut task = Task::new("t", "true");
        let mut edited = task.clone();
        edited.status = TaskStatus::Running;
        edited.description = "edited".to_string();

        assert!(matches!(
            task.apply_update(edited),
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.description.is_empty());
    }

    #[test]
    fn test_update_into_terminal_sets_finish() {
        let mut task = Task::new("t", "true");
        let mut edited = task.clone();
        edited.status = TaskStatus::Cancelled;
        task.apply_update(edited).unwrap();

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.finished_at.is_some());
        assert!(task.duration_ms.is_some());
    }

    #[test]
    fn test_stats_count() {
        let mut stats = TaskStats::default();
        stats.count(TaskStatus::Running);
        stats.count(TaskStatus::Failed);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.failed, 1);
    }
}
