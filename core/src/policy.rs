//! Plan validation against a [`Policy`] and the tool registry.
//!
//! Grounded in `coworker/policy.py`. `validate_plan` never raises: every rule
//! violation becomes a string pushed onto the result vector, and an empty
//! vector is the caller's signal to proceed.

use std::path::{Path, PathBuf};

use coworker_types::{Plan, Policy, ToolCall, ToolName};
use serde_json::Value;

use crate::registry::resolve;

const DOC_ALLOWED_KEYS: &[&str] = &["path", "max_chars", "ocr_mode"];
const WEB_ALLOWED_KEYS: &[&str] = &["url", "allowlist", "max_bytes", "method", "allow_query"];
const WEB_FORBIDDEN_KEYS: &[&str] = &["body", "payload", "data", "content", "text", "file", "files"];

/// Validate every call in `plan` against `policy`; empty result means accept.
#[must_use]
pub fn validate_plan(plan: &Plan, policy: &Policy) -> Vec<String> {
    let mut errors = Vec::new();

    if policy.allowed_roots.is_empty() {
        errors.push("no allowed roots configured".to_string());
    }

    for call in &plan.tool_calls {
        validate_call(call, policy, &mut errors);
    }

    errors
}

fn validate_call(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) {
    let Some(tool) = resolve(&call.tool) else {
        errors.push(format!("{}: unknown tool '{}'", call.id, call.tool));
        return;
    };

    match tool {
        ToolName::FsReadText => validate_fs_read_text(call, policy, errors),
        ToolName::FsListDir => validate_fs_list_dir(call, policy, errors),
        ToolName::FsProposeWriteFile | ToolName::FsApplyWriteFile => {
            validate_fs_write(call, tool, policy, errors);
        }
        ToolName::FsMove | ToolName::FsRename => validate_fs_move(call, policy, errors),
        ToolName::DocExtractPdfText => validate_doc_extract(call, policy, errors),
        ToolName::WebFetch => validate_web_fetch(call, policy, errors),
    }
}

fn resolved_path(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) -> Option<PathBuf> {
    let raw = call.args.get("path").and_then(Value::as_str);
    let Some(raw) = raw else {
        errors.push(format!("{}: missing 'path'", call.id));
        return None;
    };
    let resolved = expand_and_resolve(raw);
    if !policy.is_within_roots(&resolved) {
        errors.push(format!("{}: path '{raw}' is outside allowed roots", call.id));
        return None;
    }
    Some(resolved)
}

fn expand_and_resolve(raw: &str) -> PathBuf {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw))
    } else {
        PathBuf::from(raw)
    };
    std::fs::canonicalize(&expanded).unwrap_or(expanded)
}

fn validate_fs_read_text(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) {
    let Some(path) = resolved_path(call, policy, errors) else {
        return;
    };
    check_positive_bound(call, "max_bytes", policy.max_read_bytes, errors);
    if !path.is_file() {
        errors.push(format!("{}: file does not exist: {}", call.id, path.display()));
    }
}

fn validate_fs_list_dir(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) {
    let Some(path) = resolved_path(call, policy, errors) else {
        return;
    };
    if !path.is_dir() {
        errors.push(format!("{}: directory does not exist: {}", call.id, path.display()));
    }
}

fn validate_fs_write(call: &ToolCall, tool: ToolName, policy: &Policy, errors: &mut Vec<String>) {
    let Some(path) = resolved_path(call, policy, errors) else {
        return;
    };
    let content = call.args.get("content").and_then(Value::as_str);
    match content {
        None => errors.push(format!("{}: 'content' must be a string", call.id)),
        Some(content) => {
            if content.chars().count() as u64 > policy.max_write_bytes {
                errors.push(format!("{}: content exceeds max_write_bytes", call.id));
            }
        }
    }
    if tool == ToolName::FsApplyWriteFile {
        if path.exists() {
            errors.push(format!("{}: destination already exists: {}", call.id, path.display()));
        }
        match path.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => errors.push(format!("{}: parent directory does not exist", call.id)),
        }
    }
}

fn validate_fs_move(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) {
    let Some(src) = resolved_path(call, policy, errors) else {
        return;
    };
    let dst_raw = call.args.get("dst").and_then(Value::as_str);
    let Some(dst_raw) = dst_raw else {
        errors.push(format!("{}: missing 'dst'", call.id));
        return;
    };
    let dst = expand_and_resolve(dst_raw);
    if !policy.is_within_roots(&dst) {
        errors.push(format!("{}: dst '{dst_raw}' is outside allowed roots", call.id));
        return;
    }
    if !src.exists() {
        errors.push(format!("{}: source does not exist: {}", call.id, src.display()));
    }
    if dst.exists() {
        errors.push(format!("{}: destination already exists: {}", call.id, dst.display()));
    }
}

fn validate_doc_extract(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) {
    if let Some(bad) = first_unsupported_key(&call.args, DOC_ALLOWED_KEYS) {
        errors.push(format!("{}: unsupported argument '{bad}'", call.id));
        return;
    }
    let Some(path) = resolved_path(call, policy, errors) else {
        return;
    };
    if let Some(mode) = call.args.get("ocr_mode").and_then(Value::as_str) {
        if !matches!(mode, "off" | "ask" | "on") {
            errors.push(format!("{}: invalid ocr_mode '{mode}'", call.id));
        }
    }
    if call.args.contains_key("max_chars") {
        check_positive_bound(call, "max_chars", policy.max_read_bytes, errors);
    }
    if !path.is_file() {
        errors.push(format!("{}: file does not exist: {}", call.id, path.display()));
    }
}

fn validate_web_fetch(call: &ToolCall, policy: &Policy, errors: &mut Vec<String>) {
    if !policy.web_enabled {
        errors.push(format!("{}: web access is disabled", call.id));
        return;
    }
    if let Some(bad) = first_unsupported_key(&call.args, WEB_ALLOWED_KEYS) {
        errors.push(format!("{}: unsupported argument '{bad}'", call.id));
        return;
    }
    for forbidden in WEB_FORBIDDEN_KEYS {
        if call.args.contains_key(*forbidden) {
            errors.push(format!("{}: unsupported argument '{forbidden}'", call.id));
            return;
        }
    }

    let Some(url) = call.args.get("url").and_then(Value::as_str) else {
        errors.push(format!("{}: missing 'url'", call.id));
        return;
    };
    let Ok(parsed) = url::Url::parse(url) else {
        errors.push(format!("{}: invalid url", call.id));
        return;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        errors.push(format!("{}: url scheme must be http or https", call.id));
        return;
    }

    if let Some(method) = call.args.get("method").and_then(Value::as_str) {
        if !method.eq_ignore_ascii_case("GET") {
            errors.push(format!("{}: method must be GET", call.id));
        }
    }

    check_positive_bound(call, "max_bytes", policy.max_web_bytes, errors);

    let allowlist = call.args.get("allowlist").and_then(Value::as_array);
    let allowlist: Vec<String> = allowlist
        .map(|entries| {
            entries
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    if allowlist.is_empty() {
        errors.push(format!("{}: 'allowlist' must be a non-empty list", call.id));
        return;
    }
    let policy_allowed: Vec<String> = policy.web_allowlist.iter().map(|h| h.to_lowercase()).collect();
    for entry in &allowlist {
        let lower = entry.to_lowercase();
        if !policy_allowed.contains(&lower) {
            errors.push(format!("{}: allowlist entry '{entry}' not permitted by policy", call.id));
            return;
        }
    }

    let host = parsed.host_str().unwrap_or("").to_lowercase();
    if !host_matches_any(&host, &allowlist) {
        errors.push(format!("{}: host '{host}' is not allow-listed", call.id));
        return;
    }

    let query = parsed.query().unwrap_or("");
    if !query.is_empty() {
        let allow_query = call.args.get("allow_query").and_then(Value::as_bool).unwrap_or(false);
        if !allow_query {
            errors.push(format!("{}: query string requires allow_query=true", call.id));
        } else if query.chars().count() > policy.max_query_chars {
            errors.push(format!("{}: query string exceeds max_query_chars", call.id));
        }
    }
}

fn host_matches_any(host: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|entry| {
        let entry = entry.to_lowercase();
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

fn first_unsupported_key<'a>(args: &'a serde_json::Map<String, Value>, allowed: &[&str]) -> Option<&'a str> {
    args.keys().map(String::as_str).find(|key| !allowed.contains(key))
}

fn check_positive_bound(call: &ToolCall, key: &str, max: impl Into<i128>, errors: &mut Vec<String>) {
    let max: i128 = max.into();
    match call.args.get(key).and_then(Value::as_i64) {
        Some(value) if value > 0 && i128::from(value) <= max => {}
        Some(_) => errors.push(format!("{}: '{key}' out of range", call.id)),
        None => errors.push(format!("{}: missing '{key}'", call.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coworker_types::plan::ToolCall;
    use serde_json::json;
    use tempfile::tempdir;

    fn policy_for(root: &Path) -> Policy {
        Policy::with_roots(vec![root.to_path_buf()])
    }

    fn call(id: &str, tool: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            tool: tool.to_string(),
            args: args.as_object().unwrap().clone(),
            rollback: None,
        }
    }

    #[test]
    fn rejects_unknown_tool() {
        let dir = tempdir().unwrap();
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call("1", "fs.delete", json!({"path": "x"}))],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let errors = validate_plan(&plan, &policy_for(dir.path()));
        assert!(errors.iter().any(|e| e.contains("unknown tool")));
    }

    #[test]
    fn read_text_requires_existing_file_within_roots() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hi").unwrap();
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "fs.read_text",
                json!({"path": file.to_string_lossy(), "max_bytes": 10}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        assert!(validate_plan(&plan, &policy_for(dir.path())).is_empty());
    }

    #[test]
    fn apply_write_rejects_existing_destination() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hi").unwrap();
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "fs.apply_write_file",
                json!({"path": file.to_string_lossy(), "content": "new"}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let errors = validate_plan(&plan, &policy_for(dir.path()));
        assert!(errors.iter().any(|e| e.contains("already exists")));
    }

    #[test]
    fn web_fetch_rejected_when_disabled() {
        let dir = tempdir().unwrap();
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "web.fetch",
                json!({"url": "https://example.com", "allowlist": ["example.com"]}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let errors = validate_plan(&plan, &policy_for(dir.path()));
        assert!(errors.iter().any(|e| e.contains("web access is disabled")));
    }

    #[test]
    fn web_fetch_rejects_forbidden_body_key() {
        let dir = tempdir().unwrap();
        let mut policy = policy_for(dir.path());
        policy.web_enabled = true;
        policy.web_allowlist = vec!["example.com".to_string()];
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "web.fetch",
                json!({"url": "https://example.com", "allowlist": ["example.com"], "body": "x"}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let errors = validate_plan(&plan, &policy);
        assert!(errors.iter().any(|e| e.contains("unsupported argument 'body'")));
    }

    #[test]
    fn web_fetch_rejects_allowlist_entry_outside_policy() {
        let dir = tempdir().unwrap();
        let mut policy = policy_for(dir.path());
        policy.web_enabled = true;
        policy.web_allowlist = vec!["intranet.local".to_string()];
        let plan = Plan {
            version: 1,
            created_at: None,
            instruction: None,
            tool_calls: vec![call(
                "1",
                "web.fetch",
                json!({"url": "https://example.com", "allowlist": ["example.com"]}),
            )],
            checkpoints: vec![],
            plan_hash: None,
            approval: None,
        };
        let errors = validate_plan(&plan, &policy);
        assert!(errors.iter().any(|e| e.contains("not permitted by policy")));
    }

    #[test]
    fn host_matching_allows_subdomains() {
        assert!(host_matches_any("api.example.com", &["example.com".to_string()]));
        assert!(host_matches_any("example.com", &["example.com".to_string()]));
        assert!(!host_matches_any("evilexample.com", &["example.com".to_string()]));
    }
}
