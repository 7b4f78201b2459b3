//! Plan parsing, canonical hashing, and human-readable previews.
//!
//! Grounded in `coworker/plan.py`: the hash is a sha256 over the plan's JSON
//! serialization with `plan_hash` and `approval` stripped, keys sorted,
//! compact separators, ASCII-escaped — so two plans that differ only in
//! in-object key order or in the hash/approval fields themselves hash equal.

use std::path::Path;

use chrono::Utc;
use coworker_types::plan::{HASH_PREFIX, PLAN_VERSION, WRITE_TOOLS};
use coworker_types::{Plan, ToolCall};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::CoreError;

/// Parse a plan from raw JSON bytes and validate its structure.
pub fn parse_plan(bytes: &[u8]) -> Result<Plan, CoreError> {
    let plan: Plan =
        serde_json::from_slice(bytes).map_err(|e| CoreError::InvalidJson(e.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Load and parse a plan from disk.
pub fn load_plan(path: &Path) -> Result<Plan, CoreError> {
    let bytes = std::fs::read(path).map_err(|e| CoreError::Io(e.to_string()))?;
    parse_plan(&bytes)
}

/// Structural validation: version, tool_calls shape, per-call id/tool/args.
pub fn validate_plan(plan: &Plan) -> Result<(), CoreError> {
    if plan.version != PLAN_VERSION {
        return Err(CoreError::UnsupportedVersion(plan.version));
    }
    for (idx, call) in plan.tool_calls.iter().enumerate() {
        if call.id.trim().is_empty() {
            return Err(CoreError::BadToolCall(idx, "missing id".to_string()));
        }
        if call.tool.trim().is_empty() {
            return Err(CoreError::BadToolCall(idx, "missing tool".to_string()));
        }
    }
    Ok(())
}

/// Fill in `version`/`created_at` defaults the way the original writer does,
/// then write the plan (pretty-printed; the hash is unaffected by formatting).
pub fn write_plan(path: &Path, plan: &mut Plan) -> Result<(), CoreError> {
    ensure_plan_fields(plan);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::Io(e.to_string()))?;
    }
    let text = serde_json::to_string_pretty(plan).map_err(|e| CoreError::InvalidJson(e.to_string()))?;
    std::fs::write(path, text).map_err(|e| CoreError::Io(e.to_string()))
}

pub fn ensure_plan_fields(plan: &mut Plan) {
    if plan.version == 0 {
        plan.version = PLAN_VERSION;
    }
    if plan.created_at.is_none() {
        plan.created_at = Some(utc_now());
    }
}

/// Compute the canonical `sha256:` plan hash (does not mutate `plan`).
#[must_use]
pub fn compute_plan_hash(plan: &Plan) -> String {
    let payload = canonical_payload(plan);
    let serialized = canonical_json(&payload);
    let digest = Sha256::digest(serialized.as_bytes());
    format!("{HASH_PREFIX}{digest:x}")
}

/// Compute and stamp `plan.plan_hash`, returning the same value.
pub fn ensure_plan_hash(plan: &mut Plan) -> String {
    let hash = compute_plan_hash(plan);
    plan.plan_hash = Some(hash.clone());
    hash
}

/// The plan, serialized to a `serde_json::Value`, with `plan_hash`/`approval` stripped.
fn canonical_payload(plan: &Plan) -> Value {
    let mut value = serde_json::to_value(plan).expect("Plan always serializes");
    if let Value::Object(map) = &mut value {
        map.remove("plan_hash");
        map.remove("approval");
    }
    value
}

/// Serialize with sorted object keys and compact separators, ASCII-escaped.
///
/// `serde_json::Value`'s `Map` is a `BTreeMap` by default (no `preserve_order`
/// feature here), so `to_string` already emits keys in sorted order; we rely
/// on that rather than re-implementing key sorting.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).expect("Value always serializes")
}

/// Walk tool calls in order, counting only write-class tools, emitting the
/// call id at every `every`-th write. `every <= 0` yields no checkpoints.
#[must_use]
pub fn auto_checkpoints(tool_calls: &[ToolCall], every: i64) -> Vec<String> {
    if every <= 0 {
        return Vec::new();
    }
    let mut checkpoints = Vec::new();
    let mut write_count: i64 = 0;
    for call in tool_calls {
        if !WRITE_TOOLS.contains(&call.tool.as_str()) {
            continue;
        }
        let id = call.id.trim();
        if id.is_empty() {
            continue;
        }
        write_count += 1;
        if write_count % every == 0 {
            checkpoints.push(id.to_string());
        }
    }
    checkpoints
}

/// Human-readable preview lines, one per tool call, preceded by a count line.
#[must_use]
pub fn build_preview(plan: &Plan) -> Vec<String> {
    let mut lines = vec![format!("Tool calls: {}", plan.tool_calls.len())];
    for call in &plan.tool_calls {
        lines.push(format_tool_preview(call));
    }
    lines
}

fn format_tool_preview(call: &ToolCall) -> String {
    match call.tool.as_str() {
        "fs.move" | "fs.rename" => {
            let src = call.args.get("path").and_then(Value::as_str).unwrap_or("");
            let dst = call.args.get("dst").and_then(Value::as_str).unwrap_or("");
            let mut line = format!("- {}: {src} -> {dst}", call.tool);
            if let Some(rollback) = &call.rollback {
                line.push_str(&format!(" (rollback: {rollback})"));
            }
            line
        }
        "fs.read_text" | "fs.list_dir" | "fs.propose_write_file" | "fs.apply_write_file" => {
            let path = call.args.get("path").and_then(Value::as_str).unwrap_or("");
            format!("- {}: {path}", call.tool)
        }
        "doc.extract_pdf_text" => {
            let path = call.args.get("path").and_then(Value::as_str).unwrap_or("");
            format!("- {}: {path}", call.tool)
        }
        "web.fetch" => {
            let url = call.args.get("url").and_then(Value::as_str).unwrap_or("");
            format!("- {}: {url}", call.tool)
        }
        other => format!("- {other}"),
    }
}

fn utc_now() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coworker_types::plan::ToolCall;
    use serde_json::json;

    fn sample_plan() -> Plan {
        Plan {
            version: 1,
            created_at: Some("20260101T000000Z".to_string()),
            instruction: None,
            tool_calls: vec![ToolCall {
                id: "1".to_string(),
                tool: "fs.read_text".to_string(),
                args: json!({"path": "/tmp/a", "max_bytes": 10}).as_object().unwrap().clone(),
                rollback: None,
            }],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        }
    }

    #[test]
    fn hash_is_stable_across_hash_and_approval_fields() {
        let mut plan = sample_plan();
        let h1 = compute_plan_hash(&plan);
        plan.plan_hash = Some("sha256:deadbeef".to_string());
        plan.approval = Some(json!({"approved_by": "someone"}));
        let h2 = compute_plan_hash(&plan);
        assert_eq!(h1, h2);
        assert!(h1.starts_with(HASH_PREFIX));
    }

    #[test]
    fn hash_is_insensitive_to_arg_key_order() {
        let mut plan_a = sample_plan();
        plan_a.tool_calls[0].args = json!({"path": "/tmp/a", "max_bytes": 10})
            .as_object()
            .unwrap()
            .clone();
        let mut plan_b = sample_plan();
        plan_b.tool_calls[0].args = json!({"max_bytes": 10, "path": "/tmp/a"})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(compute_plan_hash(&plan_a), compute_plan_hash(&plan_b));
    }

    #[test]
    fn hash_is_sensitive_to_tool_call_order() {
        let mut plan = sample_plan();
        plan.tool_calls.push(ToolCall {
            id: "2".to_string(),
            tool: "fs.list_dir".to_string(),
            args: json!({"path": "/tmp"}).as_object().unwrap().clone(),
            rollback: None,
        });
        let forward = compute_plan_hash(&plan);
        plan.tool_calls.reverse();
        let reversed = compute_plan_hash(&plan);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn auto_checkpoints_counts_only_write_tools() {
        let calls = vec![
            ToolCall {
                id: "r1".into(),
                tool: "fs.read_text".into(),
                args: Default::default(),
                rollback: None,
            },
            ToolCall {
                id: "w1".into(),
                tool: "fs.apply_write_file".into(),
                args: Default::default(),
                rollback: None,
            },
            ToolCall {
                id: "w2".into(),
                tool: "fs.move".into(),
                args: Default::default(),
                rollback: None,
            },
        ];
        assert_eq!(auto_checkpoints(&calls, 2), vec!["w2".to_string()]);
        assert_eq!(auto_checkpoints(&calls, 0), Vec::<String>::new());
    }

    #[test]
    fn preview_formats_move_with_rollback() {
        let mut plan = sample_plan();
        plan.tool_calls[0] = ToolCall {
            id: "1".into(),
            tool: "fs.move".into(),
            args: json!({"path": "/a", "dst": "/b"}).as_object().unwrap().clone(),
            rollback: Some(json!({"path": "/b", "dst": "/a"})),
        };
        let preview = build_preview(&plan);
        assert_eq!(preview[0], "Tool calls: 1");
        assert!(preview[1].starts_with("- fs.move: /a -> /b (rollback:"));
    }
}
