//! Shared plumbing for the `coworker` and `coworker-runtime` binaries: exit
//! code taxonomy, state-dir/config resolution, and task-record formatting.

use std::path::PathBuf;

use coworker_runtime::CoworkerConfig;
use coworker_store::StoreError;
use coworker_types::TaskRecord;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors surfaced at the CLI boundary, mapped to the exit codes in §6:
/// 0 success (not a variant here), 1 user-visible error, 2 not-found.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    User(String),

    #[error("{0}")]
    NotFound(String),
}

impl CliError {
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::User(_) => 1,
            Self::NotFound(_) => 2,
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        Self::User(format!("{err:#}"))
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(format!("task not found: {id}")),
            other => Self::User(other.to_string()),
        }
    }
}

impl From<coworker_core::CoreError> for CliError {
    fn from(err: coworker_core::CoreError) -> Self {
        Self::User(err.to_string())
    }
}

/// Load configuration from `state_dir_flag` (highest precedence), falling
/// back to the `COWORKER_*` environment variables and the on-disk
/// `config.toml` per [`coworker_runtime::load_config`].
pub fn resolve_config(state_dir_flag: Option<PathBuf>) -> Result<CoworkerConfig, CliError> {
    coworker_runtime::load_config(state_dir_flag.as_deref()).map_err(CliError::from)
}

/// The JSON shape printed by `status` and embedded in `list` — same fields
/// as `update_task_snapshot`'s bundle-side `task.json`, so the two views of
/// one task never drift apart.
#[must_use]
pub fn task_record_json(task: &TaskRecord) -> Value {
    json!({
        "id": task.id,
        "state": task.state.as_str(),
        "created_at": task.created_at,
        "updated_at": task.updated_at,
        "plan_hash": task.plan_hash,
        "plan_path": task.plan_path,
        "bundle_path": task.bundle_path,
        "current_step": task.current_step,
        "checkpoint_id": task.checkpoint_id,
        "next_checkpoint": task.next_checkpoint,
        "locked_by": task.locked_by,
        "error": task.error,
        "metadata": task.metadata,
    })
}

#[must_use]
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[must_use]
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}
