//! Plan and tool-call data model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only plan schema version this runtime understands.
pub const PLAN_VERSION: u32 = 1;

/// Prefix every canonical plan hash carries.
pub const HASH_PREFIX: &str = "sha256:";

/// Tool names whose successful application counts toward `auto_checkpoints`.
pub const WRITE_TOOLS: &[&str] = &["fs.apply_write_file", "fs.move", "fs.rename"];

/// A single step in a plan: `{id, tool, args, rollback?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Value>,
}

/// An ordered sequence of tool calls with a stable, content-addressed hash.
///
/// `plan_hash` and `approval` are carried on the struct for convenience but are
/// excluded from the hash computation itself — see [`crate::plan`]'s
/// sibling functions in `coworker-core`, which compute and stamp this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Value>,
}

impl Plan {
    /// Tool-call `id`s that are write-class calls, in plan order.
    #[must_use]
    pub fn write_call_ids(&self) -> Vec<&str> {
        self.tool_calls
            .iter()
            .filter(|call| WRITE_TOOLS.contains(&call.tool.as_str()))
            .map(|call| call.id.as_str())
            .collect()
    }

    #[must_use]
    pub fn find_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|call| call.id == id)
    }
}
