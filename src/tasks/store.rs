// src/tasks/store.rs
//! Durable mirror of task records
//!
//! The in-memory registry stays authoritative; the store only lets records
//! survive a process restart. Writes are best-effort from the manager's side.

use crate::tasks::model::{RuntimeRequirement, Task, TaskStatus};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persistence seam used by the task manager
pub trait TaskStore: Send + Sync {
    /// Insert or replace a record keyed by its ID
    fn save(&self, task: &Task) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    fn load(&self, id: &str) -> Result<Option<Task>>;

    /// Every stored record, oldest first
    fn load_all(&self) -> Result<Vec<Task>>;

    /// Push buffered writes to durable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Task store backed by SQLite
pub struct SqliteTaskStore {
    db: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteTaskStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;

        let store = Self {
            db: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;

        info!("Task store initialized at {:?}", path);
        Ok(store)
    }

    /// Database that lives only as long as this value
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            db: Mutex::new(conn),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.db.lock();

        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                creator TEXT NOT NULL,
                assignee TEXT NOT NULL,
                command TEXT NOT NULL,
                args TEXT NOT NULL,
                working_dir TEXT,
                result_path TEXT,
                runtime TEXT,
                status TEXT NOT NULL,
                progress REAL NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                duration_ms INTEGER,
                error TEXT,
                result TEXT,
                exit_code INTEGER
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Index creation failed: {}", e)))?;

        Ok(())
    }
}

const SELECT_COLUMNS: &str = "SELECT id, name, description, creator, assignee, command, args, \
     working_dir, result_path, runtime, status, progress, created_at, started_at, finished_at, \
     duration_ms, error, result, exit_code FROM tasks";

/// Raw column values before parsing into a [`Task`]
struct TaskRow {
    id: String,
    name: String,
    description: String,
    creator: String,
    assignee: String,
    command: String,
    args: String,
    working_dir: Option<String>,
    result_path: Option<String>,
    runtime: Option<String>,
    status: String,
    progress: f64,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
    error: Option<String>,
    result: Option<String>,
    exit_code: Option<i32>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            creator: row.get(3)?,
            assignee: row.get(4)?,
            command: row.get(5)?,
            args: row.get(6)?,
            working_dir: row.get(7)?,
            result_path: row.get(8)?,
            runtime: row.get(9)?,
            status: row.get(10)?,
            progress: row.get(11)?,
            created_at: row.get(12)?,
            started_at: row.get(13)?,
            finished_at: row.get(14)?,
            duration_ms: row.get(15)?,
            error: row.get(16)?,
            result: row.get(17)?,
            exit_code: row.get(18)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let args: Vec<String> = serde_json::from_str(&self.args)
            .map_err(|e| EngineError::StorageFailed(format!("task {} args: {}", self.id, e)))?;
        let runtime: Option<RuntimeRequirement> = self
            .runtime
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| EngineError::StorageFailed(format!("task {} runtime: {}", self.id, e)))?;

        Ok(Task {
            status: self.status.parse::<TaskStatus>()?,
            created_at: parse_time(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            id: self.id,
            name: self.name,
            description: self.description,
            creator: self.creator,
            assignee: self.assignee,
            command: self.command,
            args,
            working_dir: self.working_dir.map(PathBuf::from),
            result_path: self.result_path,
            runtime,
            progress: self.progress,
            error: self.error,
            result: self.result,
            exit_code: self.exit_code,
        })
    }
}

/// Fixed-width RFC 3339 so that text order is time order
fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::StorageFailed(format!("bad timestamp '{}': {}", s, e)))
}

impl TaskStore for SqliteTaskStore {
    fn save(&self, task: &Task) -> Result<()> {
        let args = serde_json::to_string(&task.args)
            .map_err(|e| EngineError::StorageFailed(e.to_string()))?;
        let runtime = task
            .runtime
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EngineError::StorageFailed(e.to_string()))?;

        let db = self.db.lock();
        db.execute(
            r#"
            INSERT OR REPLACE INTO tasks (
                id, name, description, creator, assignee, command, args, working_dir,
                result_path, runtime, status, progress, created_at, started_at, finished_at,
                duration_ms, error, result, exit_code
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                task.id,
                task.name,
                task.description,
                task.creator,
                task.assignee,
                task.command,
                args,
                task.working_dir.as_ref().map(|p| p.display().to_string()),
                task.result_path,
                runtime,
                task.status.as_str(),
                task.progress,
                format_time(&task.created_at),
                task.started_at.as_ref().map(format_time),
                task.finished_at.as_ref().map(format_time),
                task.duration_ms.map(|d| d as i64),
                task.error,
                task.result,
                task.exit_code,
            ],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Failed to save task {}: {}", task.id, e)))?;

        debug!(task_id = %task.id, status = %task.status, "Task record saved");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Task>> {
        let row = {
            let db = self.db.lock();
            db.query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                TaskRow::from_row,
            )
            .optional()?
        };
        row.map(TaskRow::into_task).transpose()
    }

    fn load_all(&self) -> Result<Vec<Task>> {
        let rows = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare(&format!("{} ORDER BY created_at, id", SELECT_COLUMNS))
                .map_err(|e| {
                    EngineError::StorageFailed(format!("Query preparation failed: {}", e))
                })?;
            let rows = stmt
                .query_map([], TaskRow::from_row)
                .map_err(|e| EngineError::StorageFailed(format!("Query execution failed: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    EngineError::StorageFailed(format!("Result collection failed: {}", e))
                })?;
            rows
        };

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    fn flush(&self) -> Result<()> {
        if self.path.is_some() {
            let db = self.db.lock();
            db.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::environment::RuntimeKind;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let mut task = Task::new("report", "python3")
            .with_args(["report.py", "--fast"])
            .with_runtime(RuntimeKind::Python, "3.11")
            .with_creator("ops");
        task.mark_running().unwrap();
        task.mark_failed("exit code 2", Some(2)).unwrap();

        store.save(&task).unwrap();
        let loaded = store.load(&task.id).unwrap().unwrap();

        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.args, task.args);
        assert_eq!(loaded.runtime, task.runtime);
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.exit_code, Some(2));
        assert_eq!(loaded.error.as_deref(), Some("exit code 2"));
        assert_eq!(
            loaded.finished_at.map(|t| t.timestamp_millis()),
            task.finished_at.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn test_replace_and_delete() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let mut task = Task::new("t", "true");
        store.save(&task).unwrap();

        task.mark_cancelled().unwrap();
        store.save(&task).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
        assert_eq!(store.load(&task.id).unwrap().unwrap().status, TaskStatus::Cancelled);

        store.delete(&task.id).unwrap();
        assert!(store.load(&task.id).unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db").join("tasks.db");

        let first = Task::new("a", "true");
        let mut second = Task::new("b", "true");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.save(&first).unwrap();
            store.save(&second).unwrap();
            store.flush().unwrap();
        }

        let store = SqliteTaskStore::open(&path).unwrap();
        let ids: Vec<_> = store.load_all().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
