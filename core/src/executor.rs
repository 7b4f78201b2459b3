//! Plan execution: validates, dispatches tool calls, and tracks checkpoint
//! resumption state.
//!
//! Grounded in `coworker/executor.py`. The executor never automatically rolls
//! back a failed call — plans that need rollback carry explicit rollback tool
//! calls in their own right; this just runs what it's told, in order, and
//! stops cleanly at an unapproved checkpoint or at the first primitive
//! failure, rather than pressing on through later calls.

use std::path::Path;

use coworker_types::{ApprovalRecord, ExecError, Plan, Policy, ResumeState, ToolCall, ToolName};
use serde_json::Value;

use crate::plan::compute_plan_hash;
use crate::policy::validate_plan;
use crate::registry::resolve;

/// Validate `plan`, then produce one human-readable preview line per tool
/// call; when `include_diffs`, bounded diffs are rendered for
/// `fs.propose_write_file` calls.
pub async fn preview_plan(plan: &Plan, policy: &Policy, include_diffs: bool) -> Result<Vec<String>, ExecError> {
    let errors = validate_plan(plan, policy);
    if !errors.is_empty() {
        return Err(ExecError::PlanValidation(errors));
    }

    let mut lines = crate::plan::build_preview(plan);
    if include_diffs {
        for call in &plan.tool_calls {
            if call.tool == ToolName::FsProposeWriteFile.as_str() {
                if let Some(diff) = render_propose_diff(call, policy).await {
                    lines.push(diff);
                }
            }
        }
    }
    Ok(lines)
}

async fn render_propose_diff(call: &ToolCall, policy: &Policy) -> Option<String> {
    let path = call.args.get("path").and_then(Value::as_str)?;
    let content = call.args.get("content").and_then(Value::as_str)?;
    coworker_tools::fs::propose_write_file(Path::new(path), content, policy.max_read_bytes)
        .ok()
        .map(|diff| format!("diff:{path}\n{diff}"))
}

/// Execute `plan` from (optionally) a prior `resume_state`, stopping at the
/// next unapproved checkpoint when `stop_at_checkpoints` is set.
///
/// Returns the result lines produced so far and, if execution paused at a
/// checkpoint, the resume state to persist and hand back on the next call.
pub async fn apply_plan_with_state(
    plan: &Plan,
    policy: &Policy,
    approval: Option<&ApprovalRecord>,
    resume_state: Option<&ResumeState>,
    stop_at_checkpoints: bool,
) -> Result<(Vec<String>, Option<ResumeState>), ExecError> {
    let errors = validate_plan(plan, policy);
    if !errors.is_empty() {
        return Err(ExecError::PlanValidation(errors));
    }

    let plan_hash = compute_plan_hash(plan);
    if let Some(state) = resume_state {
        if state.plan_hash != plan_hash {
            return Err(ExecError::PlanValidation(vec![
                "resume state plan_hash does not match plan".to_string(),
            ]));
        }
    }

    for checkpoint in &plan.checkpoints {
        if plan.find_call(checkpoint).is_none() {
            return Err(ExecError::PlanValidation(vec![format!(
                "unknown checkpoint id '{checkpoint}'"
            )]));
        }
    }

    let mut completed_ids: Vec<String> = resume_state.map(|s| s.completed_ids.clone()).unwrap_or_default();
    let next_checkpoint = plan
        .checkpoints
        .iter()
        .find(|id| !completed_ids.contains(id))
        .cloned();

    if policy.require_approval {
        let required_checkpoint = if stop_at_checkpoints {
            next_checkpoint.as_deref()
        } else {
            None
        };
        if !approval_matches(approval, &plan_hash, required_checkpoint) {
            return Err(ExecError::Approval {
                plan_hash,
                checkpoint_id: required_checkpoint.map(str::to_owned),
            });
        }
    }

    let mut results = Vec::new();
    let last_id = plan.tool_calls.last().map(|c| c.id.clone());

    for call in &plan.tool_calls {
        if completed_ids.contains(&call.id) {
            continue;
        }

        let line = dispatch(call, policy).await.map_err(|err| ExecError::ToolFailure {
            call_id: call.id.clone(),
            message: err.to_string(),
        })?;
        results.push(line);
        completed_ids.push(call.id.clone());

        let is_checkpoint = plan.checkpoints.contains(&call.id);
        let is_final = last_id.as_deref() == Some(call.id.as_str());
        if stop_at_checkpoints && is_checkpoint && !is_final {
            let next_checkpoint = plan
                .checkpoints
                .iter()
                .find(|id| !completed_ids.contains(id))
                .cloned();
            let mut sorted = completed_ids.clone();
            sorted.sort();
            return Ok((
                results,
                Some(ResumeState {
                    plan_hash,
                    completed_ids: sorted,
                    next_checkpoint,
                    updated_at: now_iso8601(),
                }),
            ));
        }
    }

    Ok((results, None))
}

fn approval_matches(approval: Option<&ApprovalRecord>, plan_hash: &str, checkpoint_id: Option<&str>) -> bool {
    let Some(approval) = approval else {
        return false;
    };
    if approval.plan_hash != plan_hash {
        return false;
    }
    match (approval.checkpoint_id.as_deref(), checkpoint_id) {
        (None, None) => true,
        (Some(""), None) | (None, Some("")) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

async fn dispatch(call: &ToolCall, policy: &Policy) -> Result<String, coworker_tools::ToolError> {
    let Some(tool) = resolve(&call.tool) else {
        return Ok(format!("skipped:{}", call.tool));
    };

    match tool {
        ToolName::FsReadText => {
            let path = arg_path(call, "path")?;
            let max_bytes = arg_u64(call, "max_bytes").unwrap_or(policy.max_read_bytes);
            let text = coworker_tools::fs::read_text(&path, max_bytes)?;
            Ok(format!("read:{} chars={}", path.display(), text.chars().count()))
        }
        ToolName::FsListDir => {
            let path = arg_path(call, "path")?;
            let entries = coworker_tools::fs::list_dir(&path, None)?;
            Ok(format!("listed:{} entries={}", path.display(), entries.len()))
        }
        ToolName::FsProposeWriteFile => {
            let path = arg_path(call, "path")?;
            let content = arg_str(call, "content")?;
            coworker_tools::fs::propose_write_file(&path, &content, policy.max_read_bytes)?;
            Ok(format!("diff:{}", path.display()))
        }
        ToolName::FsApplyWriteFile => {
            let path = arg_path(call, "path")?;
            let content = arg_str(call, "content")?;
            coworker_tools::fs::apply_write_file(&path, &content)?;
            Ok(format!("wrote:{}", path.display()))
        }
        ToolName::FsMove | ToolName::FsRename => {
            let src = arg_path(call, "path")?;
            let dst = arg_path(call, "dst")?;
            coworker_tools::fs::move_path(&src, &dst)?;
            let mut line = format!("moved:{}->{}", src.display(), dst.display());
            if let Some(rollback) = &call.rollback {
                line.push_str(&format!(" rollback:{rollback}"));
            }
            Ok(line)
        }
        ToolName::DocExtractPdfText => {
            let path = arg_path(call, "path")?;
            let max_chars = call.args.get("max_chars").and_then(Value::as_u64).map(|v| v as usize);
            let ocr_mode = call
                .args
                .get("ocr_mode")
                .and_then(Value::as_str)
                .and_then(coworker_tools::doc::OcrMode::parse)
                .unwrap_or(coworker_tools::doc::OcrMode::Off);
            let text = coworker_tools::doc::extract_pdf_text(&path, max_chars, ocr_mode)?;
            Ok(format!("read:{} chars={}", path.display(), text.chars().count()))
        }
        ToolName::WebFetch => {
            let url = arg_str(call, "url")?;
            let max_bytes = arg_u64(call, "max_bytes").unwrap_or(policy.max_web_bytes);
            let allowlist: Vec<String> = call
                .args
                .get("allowlist")
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();
            let result = coworker_tools::web::fetch_url(&url, max_bytes, &allowlist).await?;
            Ok(format!(
                "web:{url} bytes={} type={}",
                result.text.len(),
                result.content_type
            ))
        }
    }
}

fn arg_path(call: &ToolCall, key: &str) -> Result<std::path::PathBuf, coworker_tools::ToolError> {
    arg_str(call, key).map(std::path::PathBuf::from)
}

fn arg_str(call: &ToolCall, key: &str) -> Result<String, coworker_tools::ToolError> {
    call.args
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| coworker_tools::ToolError::InvalidArgs(format!("missing '{key}'")))
}

fn arg_u64(call: &ToolCall, key: &str) -> Option<u64> {
    call.args.get(key).and_then(Value::as_u64)
}

fn now_iso8601() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coworker_types::plan::ToolCall as TC;
    use serde_json::json;
    use tempfile::tempdir;

    fn policy_for(root: &Path) -> Policy {
        let mut policy = Policy::with_roots(vec![root.to_path_buf()]);
        policy.require_approval = false;
        policy
    }

    fn call(id: &str, tool: &str, args: Value) -> TC {
        TC {
            id: id.to_string(),
            tool: tool.to_string(),
            args: args.as_object().unwrap().clone(),
            rollback: None,
        }
    }

    #[tokio::test]
    async fn applies_write_and_reports_result_line() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "fs.apply_write_file",
                json!({"path": target.to_string_lossy(), "content": "hi"}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let (results, resume) = apply_plan_with_state(&plan, &policy_for(dir.path()), None, None, false)
            .await
            .unwrap();
        assert!(resume.is_none());
        assert_eq!(results.len(), 1);
        assert!(results[0].starts_with("wrote:"));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hi");
    }

    #[tokio::test]
    async fn stops_at_checkpoint_and_resumes() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![
                call("w1", "fs.apply_write_file", json!({"path": a.to_string_lossy(), "content": "a"})),
                call("w2", "fs.apply_write_file", json!({"path": b.to_string_lossy(), "content": "b"})),
            ],
            checkpoints: vec!["w1".to_string()],
            plan_hash: None,
            approval: None,
        };
        let policy = policy_for(dir.path());

        let (results, resume) = apply_plan_with_state(&plan, &policy, None, None, true).await.unwrap();
        assert_eq!(results.len(), 1);
        let resume = resume.expect("should pause at checkpoint");
        assert_eq!(resume.completed_ids, vec!["w1".to_string()]);
        assert!(!b.exists());

        let (results, resume) = apply_plan_with_state(&plan, &policy, None, Some(&resume), true)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(resume.is_none());
        assert!(b.exists());
    }

    #[tokio::test]
    async fn checkpoint_on_final_call_does_not_pause() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call("w1", "fs.apply_write_file", json!({"path": a.to_string_lossy(), "content": "a"}))],
            checkpoints: vec!["w1".to_string()],
            plan_hash: None,
            approval: None,
        };
        let policy = policy_for(dir.path());

        let (results, resume) = apply_plan_with_state(&plan, &policy, None, None, true).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(resume.is_none(), "a checkpoint on the plan's last call has no remaining work to pause for");
        assert!(a.exists());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn tool_call_failure_aborts_remaining_calls() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let unreadable = dir.path().join("unreadable.txt");
        std::fs::write(&unreadable, "secret").unwrap();
        std::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o000)).unwrap();

        let b = dir.path().join("b.txt");
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![
                call("r1", "fs.read_text", json!({"path": unreadable.to_string_lossy()})),
                call("w2", "fs.apply_write_file", json!({"path": b.to_string_lossy(), "content": "b"})),
            ],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        // Validation only checks the file exists, so the permission failure
        // below surfaces at dispatch time, not at plan validation.
        let policy = policy_for(dir.path());

        let err = apply_plan_with_state(&plan, &policy, None, None, false).await.unwrap_err();
        assert!(matches!(err, ExecError::ToolFailure { ref call_id, .. } if call_id == "r1"));
        assert!(!b.exists(), "a failed call must stop the plan before later calls run");

        std::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[tokio::test]
    async fn missing_approval_with_require_approval_blocks_execution() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let mut policy = policy_for(dir.path());
        policy.require_approval = true;
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "fs.apply_write_file",
                json!({"path": target.to_string_lossy(), "content": "hi"}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let err = apply_plan_with_state(&plan, &policy, None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Approval { .. }));
        assert!(!target.exists());
    }
}
