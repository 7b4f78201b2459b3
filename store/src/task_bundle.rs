//! Per-task on-disk bundle: `plan.json`, `task.json`, `preview.txt`, `events.jsonl`.
//!
//! Grounded in `coworker/task_bundle.py`. Bundle operations are idempotent so
//! the daemon can call `ensure_task_bundle` on every resumed attempt without
//! worrying about double-initialization.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use coworker_types::{Plan, TaskRecord};
use coworker_utils::{AtomicWriteOptions, atomic_write_with_options};
use serde_json::{Map, Value, json};

/// Paths to the files making up one task's bundle directory.
#[derive(Debug, Clone)]
pub struct BundlePaths {
    pub root: PathBuf,
    pub plan_path: PathBuf,
    pub task_path: PathBuf,
    pub preview_path: PathBuf,
    pub events_path: PathBuf,
    pub resume_state_path: PathBuf,
}

impl BundlePaths {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            plan_path: root.join("plan.json"),
            task_path: root.join("task.json"),
            preview_path: root.join("preview.txt"),
            events_path: root.join("events.jsonl"),
            resume_state_path: root.join("resume_state.json"),
            root,
        }
    }
}

/// Create the bundle directory tree and seed `plan.json`, `preview.txt`, and
/// an empty `events.jsonl`, if they don't already exist.
pub fn init_task_bundle(paths: &BundlePaths, plan: &mut Plan, preview: &[String]) -> Result<()> {
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create bundle directory: {}", paths.root.display()))?;

    if !paths.plan_path.exists() {
        coworker_core::plan::write_plan(&paths.plan_path, plan)
            .map_err(|e| anyhow::anyhow!("failed to write plan.json: {e}"))?;
    }
    if !paths.preview_path.exists() {
        write_overwrite(&paths.preview_path, preview.join("\n").as_bytes())?;
    }
    if !paths.events_path.exists() {
        write_overwrite(&paths.events_path, b"")?;
    }
    Ok(())
}

/// Ensure the bundle exists; safe to call on every resumed attempt.
pub fn ensure_task_bundle(paths: &BundlePaths, plan: &mut Plan, preview: &[String]) -> Result<()> {
    init_task_bundle(paths, plan, preview)
}

/// Overwrite `task.json` with the current task snapshot, 2-space indented.
pub fn update_task_snapshot(paths: &BundlePaths, task: &TaskRecord) -> Result<()> {
    let snapshot = json!({
        "id": task.id,
        "state": task.state.as_str(),
        "created_at": task.created_at,
        "updated_at": task.updated_at,
        "plan_hash": task.plan_hash,
        "current_step": task.current_step,
        "checkpoint_id": task.checkpoint_id,
        "next_checkpoint": task.next_checkpoint,
        "error": task.error,
        "metadata": task.metadata,
    });
    let text = serde_json::to_vec_pretty(&snapshot).context("failed to serialize task snapshot")?;
    write_overwrite(&paths.task_path, &text)
}

/// Append one JSON object per line to `events.jsonl`. A missing `ts` field is
/// defaulted to the current UTC timestamp before serialization.
pub fn append_event(paths: &BundlePaths, mut event: Map<String, Value>) -> Result<()> {
    if !event.contains_key("ts") {
        event.insert("ts".to_string(), Value::String(utc_now()));
    }
    let mut line = serde_json::to_string(&event).context("failed to serialize event")?;
    line.push('\n');

    use std::io::Write as _;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.events_path)
        .with_context(|| format!("failed to open {}", paths.events_path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append event to {}", paths.events_path.display()))
}

/// Read all events from `events.jsonl`, one JSON value per line.
pub fn read_events(paths: &BundlePaths) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(&paths.events_path)
        .with_context(|| format!("failed to read {}", paths.events_path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("malformed event line"))
        .collect()
}

fn write_overwrite(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_write_with_options(path, bytes, AtomicWriteOptions::default())
        .with_context(|| format!("failed to write {}", path.display()))
}

fn event(kind: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("event".to_string(), Value::String(kind.to_string()));
    map
}

/// Convenience constructors for the event kinds the daemon emits.
pub mod events {
    use super::{Map, Value, event};

    #[must_use]
    pub fn task_created() -> Map<String, Value> {
        event("task_created")
    }

    #[must_use]
    pub fn task_claimed(worker_id: &str) -> Map<String, Value> {
        let mut e = event("task_claimed");
        e.insert("worker_id".to_string(), Value::String(worker_id.to_string()));
        e
    }

    #[must_use]
    pub fn task_completed() -> Map<String, Value> {
        event("task_completed")
    }

    #[must_use]
    pub fn task_canceled() -> Map<String, Value> {
        event("task_canceled")
    }

    #[must_use]
    pub fn task_lock_failed() -> Map<String, Value> {
        event("task_lock_failed")
    }

    #[must_use]
    pub fn tool_call_finished(result: &str) -> Map<String, Value> {
        let mut e = event("tool_call_finished");
        e.insert("result".to_string(), Value::String(result.to_string()));
        e
    }

    #[must_use]
    pub fn task_failed(error: &str) -> Map<String, Value> {
        let mut e = event("task_failed");
        e.insert("error".to_string(), Value::String(error.to_string()));
        e
    }

    #[must_use]
    pub fn waiting_approval(checkpoint_id: Option<&str>) -> Map<String, Value> {
        let mut e = event("waiting_approval");
        e.insert(
            "checkpoint_id".to_string(),
            checkpoint_id.map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        e
    }
}

fn utc_now() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coworker_types::plan::ToolCall;
    use tempfile::tempdir;

    fn sample_plan() -> Plan {
        Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![ToolCall {
                id: "1".to_string(),
                tool: "fs.read_text".to_string(),
                args: Default::default(),
                rollback: None,
            }],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        }
    }

    #[test]
    fn init_creates_empty_events_file_up_front() {
        let dir = tempdir().unwrap();
        let paths = BundlePaths::new(dir.path().join("task-1"));
        let mut plan = sample_plan();
        init_task_bundle(&paths, &mut plan, &["Tool calls: 1".to_string()]).unwrap();

        assert!(paths.events_path.exists());
        assert_eq!(std::fs::read_to_string(&paths.events_path).unwrap(), "");
        assert!(plan.plan_hash.is_some());
    }

    #[test]
    fn append_event_defaults_timestamp_and_appends_newline() {
        let dir = tempdir().unwrap();
        let paths = BundlePaths::new(dir.path().join("task-1"));
        let mut plan = sample_plan();
        init_task_bundle(&paths, &mut plan, &[]).unwrap();

        append_event(&paths, events::task_completed()).unwrap();
        let text = std::fs::read_to_string(&paths.events_path).unwrap();
        assert!(text.ends_with('\n'));
        let events = read_events(&paths).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].get("ts").is_some());
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let paths = BundlePaths::new(dir.path().join("task-1"));
        let mut plan = sample_plan();
        init_task_bundle(&paths, &mut plan, &[]).unwrap();
        append_event(&paths, events::task_claimed("worker-1")).unwrap();

        init_task_bundle(&paths, &mut plan, &[]).unwrap();
        let events = read_events(&paths).unwrap();
        assert_eq!(events.len(), 1, "re-init must not clobber existing events");
    }
}
