//! Durable task/approval records and the executor's resume-state snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "waiting_approval" => Self::WaitingApproval,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => return None,
        })
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable row in the task store.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub state: TaskState,
    pub created_at: String,
    pub updated_at: String,
    pub plan_hash: String,
    pub plan_path: String,
    pub bundle_path: String,
    pub current_step: i64,
    pub checkpoint_id: Option<String>,
    pub next_checkpoint: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl TaskRecord {
    #[must_use]
    pub fn metadata_path_list(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A record binding a plan hash (and optionally a checkpoint) to a decision to proceed.
#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub id: String,
    pub plan_hash: String,
    pub checkpoint_id: Option<String>,
    pub approved_at: String,
    pub approved_by: String,
}

/// Persisted executor progress, allowing exact continuation after a checkpoint pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub plan_hash: String,
    #[serde(default)]
    pub completed_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_checkpoint: Option<String>,
    pub updated_at: String,
}
