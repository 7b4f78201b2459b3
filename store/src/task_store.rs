//! SQLite-backed task and approval storage.
//!
//! Grounded in `coworker/task_store.py`, with the secure-database-file
//! opening convention carried over from this crate's tool journal (WAL mode,
//! 0600 file permissions, 0700 parent directory — see [`crate::sqlite_util`]).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use coworker_types::{TaskRecord, TaskState};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::sqlite_util::{open_secure_db, system_time_to_iso8601};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        plan_hash TEXT NOT NULL,
        plan_path TEXT NOT NULL,
        bundle_path TEXT NOT NULL,
        current_step INTEGER NOT NULL DEFAULT 0,
        checkpoint_id TEXT,
        next_checkpoint TEXT,
        locked_by TEXT,
        locked_at TEXT,
        error TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
    CREATE INDEX IF NOT EXISTS idx_tasks_plan_hash ON tasks(plan_hash);

    CREATE TABLE IF NOT EXISTS approvals (
        id TEXT PRIMARY KEY,
        plan_hash TEXT NOT NULL,
        checkpoint_id TEXT,
        approved_at TEXT NOT NULL,
        approved_by TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_approvals_plan_checkpoint
        ON approvals(plan_hash, checkpoint_id);
";

/// An explicit tri-state update for a nullable column: leave it alone, clear
/// it, or set it to a new value. Plain `Option<T>` can't express "leave
/// alone" and "set to null" as distinct cases, which `next_checkpoint`
/// updates need (a checkpoint pause clearing back to the plan's start).
#[derive(Debug, Clone, Default)]
pub enum ColumnUpdate<T> {
    #[default]
    Unchanged,
    SetNull,
    SetValue(T),
}

impl<T> ColumnUpdate<T> {
    fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Unchanged => current,
            Self::SetNull => None,
            Self::SetValue(v) => Some(v),
        }
    }
}

/// A partial update to a task row; fields left `None`/`Unchanged` are left alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub error: ColumnUpdate<String>,
    pub checkpoint_id: ColumnUpdate<String>,
    pub next_checkpoint: ColumnUpdate<String>,
    pub current_step: Option<i64>,
    pub locked_by: ColumnUpdate<String>,
    pub locked_at: ColumnUpdate<String>,
}

pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_secure_db(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set task store pragmas")?;
        conn.execute_batch(SCHEMA).context("failed to create task store schema")?;
        record_schema_version(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory task store")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        record_schema_version(&conn)?;
        Ok(Self { conn })
    }

    pub fn create_task(
        &self,
        id: &str,
        plan_hash: &str,
        plan_path: &Path,
        bundle_path: &Path,
        metadata: Map<String, Value>,
    ) -> Result<TaskRecord, StoreError> {
        let now = now_iso8601();
        let metadata_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT INTO tasks (id, state, created_at, updated_at, plan_hash, plan_path, bundle_path, current_step, metadata_json)
             VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                id,
                TaskState::Queued.as_str(),
                now,
                plan_hash,
                plan_path.to_string_lossy(),
                bundle_path.to_string_lossy(),
                metadata_json
            ],
        )?;
        self.get_task(id)
    }

    pub fn get_task(&self, id: &str) -> Result<TaskRecord, StoreError> {
        self.conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn list_tasks(&self, state: Option<TaskState>, limit: i64, offset: i64) -> Result<Vec<TaskRecord>, StoreError> {
        let mut stmt = if state.is_some() {
            self.conn.prepare(
                "SELECT * FROM tasks WHERE state = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?
        } else {
            self.conn
                .prepare("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2")?
        };
        let rows = if let Some(state) = state {
            stmt.query_map(params![state.as_str(), limit, offset], row_to_task)?
        } else {
            stmt.query_map(params![limit, offset], row_to_task)?
        };
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn count_tasks_by_state(&self, state: Option<TaskState>) -> Result<i64, StoreError> {
        let count = if let Some(state) = state {
            self.conn
                .query_row("SELECT COUNT(*) FROM tasks WHERE state = ?1", params![state.as_str()], |r| r.get(0))?
        } else {
            self.conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?
        };
        Ok(count)
    }

    /// Atomically claim the oldest queued task, if any.
    pub fn claim_next_task(&self, worker_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let candidate: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM tasks WHERE state = ?1 ORDER BY updated_at ASC, created_at ASC LIMIT 1",
                params![TaskState::Queued.as_str()],
                |r| r.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            self.conn.execute_batch("COMMIT")?;
            return Ok(None);
        };

        let now = now_iso8601();
        let updated = self.conn.execute(
            "UPDATE tasks SET state = ?1, locked_by = ?2, locked_at = ?3, updated_at = ?3
             WHERE id = ?4 AND state = ?5",
            params![TaskState::Running.as_str(), worker_id, now, id, TaskState::Queued.as_str()],
        )?;
        self.conn.execute_batch("COMMIT")?;

        if updated == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_task(&id)?))
    }

    /// Conditionally move a task from `expected_state` to `running`, claimed by `worker_id`.
    pub fn claim_task(&self, id: &str, expected_state: TaskState, worker_id: &str) -> Result<bool, StoreError> {
        let now = now_iso8601();
        let updated = self.conn.execute(
            "UPDATE tasks SET state = ?1, locked_by = ?2, locked_at = ?3, updated_at = ?3
             WHERE id = ?4 AND state = ?5",
            params![TaskState::Running.as_str(), worker_id, now, id, expected_state.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub fn update_task_state(&self, id: &str, update: TaskUpdate) -> Result<(), StoreError> {
        let current = self.get_task(id)?;
        let now = now_iso8601();

        let state = update.state.unwrap_or(current.state);
        let error = update.error.apply(current.error);
        let checkpoint_id = update.checkpoint_id.apply(current.checkpoint_id);
        let next_checkpoint = update.next_checkpoint.apply(current.next_checkpoint);
        let current_step = update.current_step.unwrap_or(current.current_step);
        let locked_by = update.locked_by.apply(current.locked_by);
        let locked_at = update.locked_at.apply(current.locked_at);

        self.conn.execute(
            "UPDATE tasks SET state = ?1, error = ?2, checkpoint_id = ?3, next_checkpoint = ?4,
             current_step = ?5, locked_by = ?6, locked_at = ?7, updated_at = ?8 WHERE id = ?9",
            params![
                state.as_str(),
                error,
                checkpoint_id,
                next_checkpoint,
                current_step,
                locked_by,
                locked_at,
                now,
                id
            ],
        )?;
        Ok(())
    }

    pub fn record_approval(
        &self,
        id: &str,
        plan_hash: &str,
        checkpoint_id: Option<&str>,
        approved_by: &str,
    ) -> Result<(), StoreError> {
        let now = now_iso8601();
        self.conn.execute(
            "INSERT INTO approvals (id, plan_hash, checkpoint_id, approved_at, approved_by) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, plan_hash, checkpoint_id, now, approved_by],
        )?;
        Ok(())
    }

    pub fn latest_approval(&self, plan_hash: &str, checkpoint_id: Option<&str>) -> Result<Option<ApprovalRow>, StoreError> {
        let row = self.conn.query_row(
            "SELECT id, plan_hash, checkpoint_id, approved_at, approved_by FROM approvals
             WHERE plan_hash = ?1 AND checkpoint_id IS ?2
             ORDER BY approved_at DESC LIMIT 1",
            params![plan_hash, checkpoint_id],
            row_to_approval,
        );
        Ok(row.optional()?)
    }

    pub fn latest_approval_any(&self, plan_hash: &str) -> Result<Option<ApprovalRow>, StoreError> {
        let row = self.conn.query_row(
            "SELECT id, plan_hash, checkpoint_id, approved_at, approved_by FROM approvals
             WHERE plan_hash = ?1 ORDER BY approved_at DESC LIMIT 1",
            params![plan_hash],
            row_to_approval,
        );
        Ok(row.optional()?)
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalRow {
    pub id: String,
    pub plan_hash: String,
    pub checkpoint_id: Option<String>,
    pub approved_at: String,
    pub approved_by: String,
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRow> {
    Ok(ApprovalRow {
        id: row.get("id")?,
        plan_hash: row.get("plan_hash")?,
        checkpoint_id: row.get("checkpoint_id")?,
        approved_at: row.get("approved_at")?,
        approved_by: row.get("approved_by")?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state_str: String = row.get("state")?;
    let state = TaskState::parse(&state_str).unwrap_or(TaskState::Failed);
    let metadata_json: String = row.get("metadata_json")?;
    let metadata_value: Value = serde_json::from_str(&metadata_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let metadata = metadata_value.as_object().cloned().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("metadata_json is not a JSON object: {metadata_json}"),
            )),
        )
    })?;

    Ok(TaskRecord {
        id: row.get("id")?,
        state,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        plan_hash: row.get("plan_hash")?,
        plan_path: row.get("plan_path")?,
        bundle_path: row.get("bundle_path")?,
        current_step: row.get("current_step")?,
        checkpoint_id: row.get("checkpoint_id")?,
        next_checkpoint: row.get("next_checkpoint")?,
        locked_by: row.get("locked_by")?,
        locked_at: row.get("locked_at")?,
        error: row.get("error")?,
        metadata,
    })
}

fn record_schema_version(conn: &Connection) -> Result<()> {
    let applied: Option<i64> = conn
        .query_row("SELECT version FROM schema_migrations WHERE version = ?1", params![SCHEMA_VERSION], |r| r.get(0))
        .optional()?;
    if applied.is_none() {
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now_iso8601()],
        )?;
    }
    Ok(())
}

fn now_iso8601() -> String {
    system_time_to_iso8601(std::time::SystemTime::now())
}

pub fn bundle_dir_for(state_dir: &Path, task_id: &str) -> PathBuf {
    state_dir.join("tasks").join(task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_round_trips() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = store
            .create_task("t1", "sha256:abc", Path::new("/tmp/plan.json"), Path::new("/tmp/bundle"), Map::new())
            .unwrap();
        assert_eq!(task.state, TaskState::Queued);
        let fetched = store.get_task("t1").unwrap();
        assert_eq!(fetched.id, "t1");
    }

    #[test]
    fn claim_next_task_only_claims_queued() {
        let store = TaskStore::open_in_memory().unwrap();
        store
            .create_task("t1", "sha256:abc", Path::new("/p"), Path::new("/b"), Map::new())
            .unwrap();
        let claimed = store.claim_next_task("worker-1").unwrap().unwrap();
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));
        assert!(store.claim_next_task("worker-2").unwrap().is_none());
    }

    #[test]
    fn requeue_moves_task_behind_others_by_updated_at() {
        let store = TaskStore::open_in_memory().unwrap();
        store
            .create_task("t1", "sha256:a", Path::new("/p"), Path::new("/b"), Map::new())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .create_task("t2", "sha256:b", Path::new("/p"), Path::new("/b"), Map::new())
            .unwrap();

        // t1 claimed then requeued -> its updated_at advances past t2's.
        store.claim_next_task("w1").unwrap();
        store
            .update_task_state(
                "t1",
                TaskUpdate {
                    state: Some(TaskState::Queued),
                    locked_by: ColumnUpdate::SetNull,
                    locked_at: ColumnUpdate::SetNull,
                    ..Default::default()
                },
            )
            .unwrap();

        let next = store.claim_next_task("w2").unwrap().unwrap();
        assert_eq!(next.id, "t2");
    }

    #[test]
    fn next_checkpoint_tri_state_distinguishes_unchanged_from_null() {
        let store = TaskStore::open_in_memory().unwrap();
        store
            .create_task("t1", "sha256:a", Path::new("/p"), Path::new("/b"), Map::new())
            .unwrap();
        store
            .update_task_state(
                "t1",
                TaskUpdate {
                    next_checkpoint: ColumnUpdate::SetValue("cp1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.get_task("t1").unwrap().next_checkpoint.as_deref(), Some("cp1"));

        store
            .update_task_state("t1", TaskUpdate { current_step: Some(2), ..Default::default() })
            .unwrap();
        assert_eq!(store.get_task("t1").unwrap().next_checkpoint.as_deref(), Some("cp1"));

        store
            .update_task_state("t1", TaskUpdate { next_checkpoint: ColumnUpdate::SetNull, ..Default::default() })
            .unwrap();
        assert_eq!(store.get_task("t1").unwrap().next_checkpoint, None);
    }

    #[test]
    fn approval_matching_distinguishes_checkpoint_scoped_from_plan_level() {
        let store = TaskStore::open_in_memory().unwrap();
        store.record_approval("a1", "sha256:a", Some("cp1"), "alice").unwrap();
        assert!(store.latest_approval("sha256:a", None).unwrap().is_none());
        assert!(store.latest_approval("sha256:a", Some("cp1")).unwrap().is_some());
    }
}
