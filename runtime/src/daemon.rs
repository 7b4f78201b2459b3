//! The claim/execute worker loop: `run_once` drives a single tick, `run_loop`
//! repeats it on a poll interval across one or more worker ids.
//!
//! Grounded in `coworker/daemon.py`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use coworker_core::executor::apply_plan_with_state;
use coworker_core::plan::{build_preview, compute_plan_hash, load_plan};
use coworker_store::task_bundle::events;
use coworker_store::{
    BundlePaths, ColumnUpdate, TaskStore, TaskUpdate, acquire_locks, append_event,
    ensure_task_bundle, release_task_locks, update_task_snapshot,
};
use coworker_types::{ApprovalRecord, ExecError, ResumeState, TaskRecord, TaskState};

use crate::config::CoworkerConfig;

/// Outcome of one `run_once` tick, surfaced to the daemon's own logging.
#[derive(Debug, Clone)]
pub struct DaemonResult {
    pub claimed_task_id: Option<String>,
    pub message: String,
}

impl DaemonResult {
    fn worked(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { claimed_task_id: Some(task_id.into()), message: message.into() }
    }

    fn idle(message: impl Into<String>) -> Self {
        Self { claimed_task_id: None, message: message.into() }
    }
}

/// One claim/execute tick: try a queued task first, then fall back to
/// promoting an approved `waiting_approval` task.
pub async fn run_once(store: &TaskStore, config: &CoworkerConfig, worker_id: &str) -> DaemonResult {
    match store.claim_next_task(worker_id) {
        Ok(Some(task)) => {
            let task_id = task.id.clone();
            match run_task(store, config, task, worker_id).await {
                Ok(true) => DaemonResult::worked(task_id, "ran claimed task"),
                Ok(false) => match claim_waiting_task(store, config, worker_id).await {
                    Ok(Some(id)) => DaemonResult::worked(id, "promoted a waiting_approval task after lock conflict"),
                    Ok(None) => DaemonResult::idle("claimed task deferred on lock conflict; no waiting_approval task ready"),
                    Err(err) => DaemonResult::idle(format!("error while promoting waiting_approval task: {err:#}")),
                },
                Err(err) => {
                    let message = err.to_string();
                    fail_task_best_effort(store, config, &task_id, &message);
                    DaemonResult::worked(task_id, format!("task failed: {message}"))
                }
            }
        }
        Ok(None) => match claim_waiting_task(store, config, worker_id).await {
            Ok(Some(id)) => DaemonResult::worked(id, "promoted a waiting_approval task"),
            Ok(None) => DaemonResult::idle("no work available"),
            Err(err) => DaemonResult::idle(format!("error while promoting waiting_approval task: {err:#}")),
        },
        Err(err) => DaemonResult::idle(format!("error claiming next task: {err:#}")),
    }
}

/// Run the daemon continuously: sleep `config.poll_seconds` whenever a tick
/// found no work; otherwise loop immediately. `worker_count` workers each
/// run one tick per round under distinct worker ids.
pub async fn run_loop(store: &TaskStore, config: &CoworkerConfig, worker_prefix: &str) -> ! {
    loop {
        let mut any_work = false;
        for index in 0..config.worker_count.max(1) {
            let worker_id = format!("{worker_prefix}-{index}");
            let result = run_once(store, config, &worker_id).await;
            tracing::info!(worker_id = %worker_id, message = %result.message, "run_once tick");
            any_work |= result.claimed_task_id.is_some();
        }
        if !any_work {
            tokio::time::sleep(Duration::from_secs(config.poll_seconds.max(1))).await;
        }
    }
}

/// Paginate `waiting_approval` tasks in pages of 50, claiming the first one
/// whose plan hash/checkpoint has a matching approval and whose CAS claim
/// succeeds. A CAS race loss falls through to the next candidate instead of
/// aborting the scan.
async fn claim_waiting_task(store: &TaskStore, config: &CoworkerConfig, worker_id: &str) -> Result<Option<String>> {
    const PAGE_SIZE: i64 = 50;
    let mut offset = 0i64;
    loop {
        let page = store.list_tasks(Some(TaskState::WaitingApproval), PAGE_SIZE, offset)?;
        if page.is_empty() {
            return Ok(None);
        }
        let page_len = page.len();

        for candidate in page {
            let approval = store.latest_approval(&candidate.plan_hash, candidate.next_checkpoint.as_deref())?;
            if approval.is_none() {
                continue;
            }
            if store.claim_task(&candidate.id, TaskState::WaitingApproval, worker_id)? {
                let claimed = store.get_task(&candidate.id)?;
                run_task(store, config, claimed, worker_id).await?;
                return Ok(Some(candidate.id));
            }
        }

        offset += page_len as i64;
    }
}

/// Execute (or resume) one claimed task to completion, a checkpoint pause, or
/// a terminal failure. Returns `Ok(false)` only when the task's path locks
/// conflicted with another task's and the caller should try something else.
async fn run_task(store: &TaskStore, config: &CoworkerConfig, task: TaskRecord, worker_id: &str) -> Result<bool> {
    let task = store.get_task(&task.id).context("re-reading claimed task")?;
    let bundle_paths = BundlePaths::new(PathBuf::from(&task.bundle_path));

    if task.state == TaskState::Canceled {
        append_event(&bundle_paths, events::task_canceled())?;
        update_task_snapshot(&bundle_paths, &task)?;
        return Ok(true);
    }

    let locks_dir = config.state_dir.join("locks");
    let lock_paths = lock_paths_for(&task, &config.state_dir);
    let mut lock_handle = acquire_locks(&lock_paths, &locks_dir, &task.id, worker_id)?;
    if lock_handle.is_empty() {
        store.update_task_state(
            &task.id,
            TaskUpdate {
                state: Some(TaskState::Queued),
                locked_by: ColumnUpdate::SetNull,
                locked_at: ColumnUpdate::SetNull,
                ..Default::default()
            },
        )?;
        append_event(&bundle_paths, events::task_lock_failed())?;
        return Ok(false);
    }

    let plan_path = if bundle_paths.plan_path.exists() { bundle_paths.plan_path.clone() } else { PathBuf::from(&task.plan_path) };
    let mut plan = match load_plan(&plan_path) {
        Ok(plan) => plan,
        Err(err) => {
            lock_handle.release();
            return fail(store, &bundle_paths, &task, format!("failed to load plan: {err}"));
        }
    };
    let plan_hash = compute_plan_hash(&plan);
    if plan_hash != task.plan_hash {
        lock_handle.release();
        return fail(store, &bundle_paths, &task, "plan hash mismatch; refusing to execute".to_string());
    }

    let selected_paths: Vec<PathBuf> = task.metadata_path_list("selected_paths").into_iter().map(PathBuf::from).collect();
    let allow_roots: Vec<PathBuf> = task.metadata_path_list("allow_roots").into_iter().map(PathBuf::from).collect();
    let policy = config.build_policy(&selected_paths, &allow_roots);

    let preview = build_preview(&plan);
    ensure_task_bundle(&bundle_paths, &mut plan, &preview)?;
    append_event(&bundle_paths, events::task_claimed(worker_id))?;
    let task = store.get_task(&task.id)?;
    update_task_snapshot(&bundle_paths, &task)?;

    let resume_state = read_resume_state(&bundle_paths.resume_state_path);
    let checkpoint_id = match &resume_state {
        Some(state) => state.next_checkpoint.clone(),
        None => plan.checkpoints.first().cloned(),
    };

    let approval_row = store.latest_approval(&plan_hash, checkpoint_id.as_deref())?;
    let approval = approval_row.map(|row| ApprovalRecord {
        id: row.id,
        plan_hash: row.plan_hash,
        checkpoint_id: row.checkpoint_id,
        approved_at: row.approved_at,
        approved_by: row.approved_by,
    });

    if policy.require_approval && approval.is_none() {
        lock_handle.retain();
        return wait_for_approval(store, &bundle_paths, &task, checkpoint_id);
    }

    let stop_at_checkpoints = !plan.checkpoints.is_empty() && policy.require_approval;
    let outcome = apply_plan_with_state(&plan, &policy, approval.as_ref(), resume_state.as_ref(), stop_at_checkpoints).await;

    let (results, resumed) = match outcome {
        Ok(pair) => pair,
        Err(ExecError::Approval { checkpoint_id, .. }) => {
            lock_handle.retain();
            return wait_for_approval(store, &bundle_paths, &task, checkpoint_id);
        }
        Err(ExecError::PlanValidation(errors)) => {
            lock_handle.release();
            return fail(store, &bundle_paths, &task, errors.join("; "));
        }
        Err(ExecError::ToolFailure { call_id, message }) => {
            lock_handle.release();
            return fail(store, &bundle_paths, &task, format!("tool call '{call_id}' failed: {message}"));
        }
    };

    for line in &results {
        append_event(&bundle_paths, events::tool_call_finished(line))?;
    }

    let current = store.get_task(&task.id)?;
    if current.state == TaskState::Canceled {
        lock_handle.release();
        return Ok(true);
    }

    if let Some(resume) = resumed {
        write_resume_state(&bundle_paths.resume_state_path, &resume)?;
        let completed = resume.completed_ids.len() as i64;
        lock_handle.retain();
        store.update_task_state(
            &task.id,
            TaskUpdate {
                state: Some(TaskState::WaitingApproval),
                next_checkpoint: resume.next_checkpoint.clone().map_or(ColumnUpdate::SetNull, ColumnUpdate::SetValue),
                current_step: Some(completed),
                ..Default::default()
            },
        )?;
        let task = store.get_task(&task.id)?;
        append_event(&bundle_paths, events::waiting_approval(resume.next_checkpoint.as_deref()))?;
        update_task_snapshot(&bundle_paths, &task)?;
        return Ok(true);
    }

    lock_handle.release();
    store.update_task_state(
        &task.id,
        TaskUpdate {
            state: Some(TaskState::Completed),
            current_step: Some(plan.tool_calls.len() as i64),
            locked_by: ColumnUpdate::SetNull,
            locked_at: ColumnUpdate::SetNull,
            ..Default::default()
        },
    )?;
    let task = store.get_task(&task.id)?;
    append_event(&bundle_paths, events::task_completed())?;
    update_task_snapshot(&bundle_paths, &task)?;
    Ok(true)
}

fn wait_for_approval(store: &TaskStore, bundle_paths: &BundlePaths, task: &TaskRecord, checkpoint_id: Option<String>) -> Result<bool> {
    store.update_task_state(
        &task.id,
        TaskUpdate {
            state: Some(TaskState::WaitingApproval),
            next_checkpoint: checkpoint_id.clone().map_or(ColumnUpdate::SetNull, ColumnUpdate::SetValue),
            ..Default::default()
        },
    )?;
    let task = store.get_task(&task.id)?;
    append_event(bundle_paths, events::waiting_approval(checkpoint_id.as_deref()))?;
    update_task_snapshot(bundle_paths, &task)?;
    Ok(true)
}

fn fail(store: &TaskStore, bundle_paths: &BundlePaths, task: &TaskRecord, error: String) -> Result<bool> {
    store.update_task_state(
        &task.id,
        TaskUpdate {
            state: Some(TaskState::Failed),
            error: ColumnUpdate::SetValue(error.clone()),
            locked_by: ColumnUpdate::SetNull,
            locked_at: ColumnUpdate::SetNull,
            ..Default::default()
        },
    )?;
    let task = store.get_task(&task.id)?;
    append_event(bundle_paths, events::task_failed(&error))?;
    update_task_snapshot(bundle_paths, &task)?;
    Ok(true)
}

/// Best-effort cleanup when `run_task` itself returns an error (IO/store
/// failure rather than a business-level plan/approval rejection): mark the
/// task failed and release whatever locks it might hold.
fn fail_task_best_effort(store: &TaskStore, config: &CoworkerConfig, task_id: &str, message: &str) {
    let Ok(task) = store.get_task(task_id) else { return };
    let _ = store.update_task_state(
        task_id,
        TaskUpdate {
            state: Some(TaskState::Failed),
            error: ColumnUpdate::SetValue(message.to_string()),
            locked_by: ColumnUpdate::SetNull,
            locked_at: ColumnUpdate::SetNull,
            ..Default::default()
        },
    );
    let locks_dir = config.state_dir.join("locks");
    let lock_paths = lock_paths_for(&task, &config.state_dir);
    release_task_locks(&lock_paths, &locks_dir, task_id);

    let bundle_paths = BundlePaths::new(PathBuf::from(&task.bundle_path));
    let _ = append_event(&bundle_paths, events::task_failed(message));
    if let Ok(task) = store.get_task(task_id) {
        let _ = update_task_snapshot(&bundle_paths, &task);
    }
}

/// Locks to acquire per §4.10 step 2: selected paths, else already-resolved
/// allowed roots, else the whole state directory.
fn lock_paths_for(task: &TaskRecord, state_dir: &std::path::Path) -> Vec<PathBuf> {
    let selected = task.metadata_path_list("selected_paths");
    if !selected.is_empty() {
        return selected.into_iter().map(PathBuf::from).collect();
    }
    let allowed_roots = task.metadata_path_list("allowed_roots");
    if !allowed_roots.is_empty() {
        return allowed_roots.into_iter().map(PathBuf::from).collect();
    }
    vec![state_dir.to_path_buf()]
}

fn read_resume_state(path: &std::path::Path) -> Option<ResumeState> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_resume_state(path: &std::path::Path, state: &ResumeState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state).context("failed to serialize resume state")?;
    coworker_utils::atomic_write_with_options(path, &bytes, coworker_utils::AtomicWriteOptions::default())
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Cancel a task: always moves it to `canceled`; releases its path locks
/// immediately unless it's currently being executed by a worker (the worker
/// releases them itself once it observes the cancellation).
pub fn cancel_task(store: &TaskStore, config: &CoworkerConfig, task_id: &str) -> Result<()> {
    let task = store.get_task(task_id)?;
    let was_running = task.state == TaskState::Running;
    store.update_task_state(task_id, TaskUpdate { state: Some(TaskState::Canceled), ..Default::default() })?;
    if !was_running {
        let locks_dir = config.state_dir.join("locks");
        let lock_paths = lock_paths_for(&task, &config.state_dir);
        release_task_locks(&lock_paths, &locks_dir, task_id);
    }
    let bundle_paths = BundlePaths::new(PathBuf::from(&task.bundle_path));
    append_event(&bundle_paths, events::task_canceled())?;
    let task = store.get_task(task_id)?;
    update_task_snapshot(&bundle_paths, &task)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coworker_core::plan::ensure_plan_hash;
    use coworker_store::task_store::bundle_dir_for;
    use coworker_types::plan::ToolCall;
    use coworker_types::Plan;
    use serde_json::json;
    use tempfile::tempdir;

    fn submit(store: &TaskStore, state_dir: &std::path::Path, task_id: &str, mut plan: Plan, selected_path: &std::path::Path) -> String {
        let plan_hash = ensure_plan_hash(&mut plan);
        let bundle_path = bundle_dir_for(state_dir, task_id);
        let paths = BundlePaths::new(bundle_path.clone());
        let preview = build_preview(&plan);
        ensure_task_bundle(&paths, &mut plan, &preview).unwrap();

        let metadata = json!({"selected_paths": [selected_path.to_string_lossy()]}).as_object().unwrap().clone();
        store.create_task(task_id, &plan_hash, &paths.plan_path, &bundle_path, metadata).unwrap();
        plan_hash
    }

    fn write_call(id: &str, path: &std::path::Path, content: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            tool: "fs.apply_write_file".to_string(),
            args: json!({"path": path.to_string_lossy(), "content": content}).as_object().unwrap().clone(),
            rollback: None,
        }
    }

    fn bare_plan(calls: Vec<ToolCall>, checkpoints: Vec<String>) -> Plan {
        Plan { version: 1, created_at: None, instruction: None, tool_calls: calls, checkpoints, plan_hash: None, approval: None }
    }

    #[tokio::test]
    async fn run_once_executes_queued_task_to_completion() {
        let root = tempdir().unwrap();
        let state_dir = root.path().join("state");
        let target = root.path().join("out.txt");
        let store = TaskStore::open_in_memory().unwrap();

        let plan = bare_plan(vec![write_call("w1", &target, "hello")], vec![]);
        submit(&store, &state_dir, "t1", plan, root.path());

        let mut config = CoworkerConfig::default();
        config.state_dir = state_dir;
        config.allowed_paths = vec![root.path().to_path_buf()];
        config.require_approval = false;

        let result = run_once(&store, &config, "worker-1").await;
        assert_eq!(result.claimed_task_id.as_deref(), Some("t1"));
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Completed);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
    }

    #[tokio::test]
    async fn lock_conflict_requeues_task_without_running_it() {
        let root = tempdir().unwrap();
        let state_dir = root.path().join("state");
        let target = root.path().join("out.txt");
        let store = TaskStore::open_in_memory().unwrap();

        let plan = bare_plan(vec![write_call("w1", &target, "hello")], vec![]);
        submit(&store, &state_dir, "t1", plan, &target);

        let locks_dir = state_dir.join("locks");
        std::fs::create_dir_all(&locks_dir).unwrap();
        let held_by_other = acquire_locks(&[target.clone()], &locks_dir, "other-task", "someone-else").unwrap();
        assert!(!held_by_other.is_empty());

        let mut config = CoworkerConfig::default();
        config.state_dir = state_dir;
        config.allowed_paths = vec![root.path().to_path_buf()];
        config.require_approval = false;

        let result = run_once(&store, &config, "worker-1").await;
        assert!(result.claimed_task_id.is_none());
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Queued);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn checkpoint_pause_requires_separate_approvals_to_finish() {
        let root = tempdir().unwrap();
        let state_dir = root.path().join("state");
        let a = root.path().join("a.txt");
        let b = root.path().join("b.txt");
        let store = TaskStore::open_in_memory().unwrap();

        let plan = bare_plan(vec![write_call("w1", &a, "a"), write_call("w2", &b, "b")], vec!["w1".to_string()]);
        let plan_hash = submit(&store, &state_dir, "t1", plan, root.path());

        let mut config = CoworkerConfig::default();
        config.state_dir = state_dir;
        config.allowed_paths = vec![root.path().to_path_buf()];
        config.require_approval = true;

        // First tick: checkpoint "w1" has no approval yet, so nothing runs.
        run_once(&store, &config, "worker-1").await;
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::WaitingApproval);
        assert!(!a.exists());

        // Approve the checkpoint; the worker runs up to and including w1, then
        // pauses again because the remaining work needs its own approval.
        store.record_approval("approve-w1", &plan_hash, Some("w1"), "tester").unwrap();
        run_once(&store, &config, "worker-2").await;
        assert!(a.exists());
        assert!(!b.exists());
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::WaitingApproval);

        // Approve the plan-level (post-checkpoint) continuation to finish.
        store.record_approval("approve-final", &plan_hash, None, "tester").unwrap();
        run_once(&store, &config, "worker-3").await;
        assert!(b.exists());
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn approval_for_a_different_plan_hash_leaves_task_waiting() {
        let root = tempdir().unwrap();
        let state_dir = root.path().join("state");
        let target = root.path().join("out.txt");
        let store = TaskStore::open_in_memory().unwrap();

        let plan = bare_plan(vec![write_call("w1", &target, "hello")], vec![]);
        submit(&store, &state_dir, "t1", plan, root.path());
        store.record_approval("approve-wrong", "not-the-right-hash", None, "tester").unwrap();

        let mut config = CoworkerConfig::default();
        config.state_dir = state_dir;
        config.allowed_paths = vec![root.path().to_path_buf()];
        config.require_approval = true;

        let result = run_once(&store, &config, "worker-1").await;
        assert!(result.claimed_task_id.is_none());
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::WaitingApproval);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn canceling_a_waiting_task_releases_its_locks_and_blocks_later_approval() {
        let root = tempdir().unwrap();
        let state_dir = root.path().join("state");
        let target = root.path().join("out.txt");
        let store = TaskStore::open_in_memory().unwrap();

        let plan = bare_plan(vec![write_call("w1", &target, "hello")], vec![]);
        let plan_hash = submit(&store, &state_dir, "t1", plan, root.path());

        let mut config = CoworkerConfig::default();
        config.state_dir = state_dir.clone();
        config.allowed_paths = vec![root.path().to_path_buf()];
        config.require_approval = true;

        run_once(&store, &config, "worker-1").await;
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::WaitingApproval);

        cancel_task(&store, &config, "t1").unwrap();
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Canceled);

        let locks_dir = state_dir.join("locks");
        let reacquired = acquire_locks(&[root.path().to_path_buf()], &locks_dir, "other-task", "someone-else").unwrap();
        assert!(!reacquired.is_empty(), "canceling a waiting task must release its path locks");

        store.record_approval("approve-late", &plan_hash, None, "tester").unwrap();
        run_once(&store, &config, "worker-2").await;
        assert_eq!(store.get_task("t1").unwrap().state, TaskState::Canceled);
        assert!(!target.exists(), "a late approval must not resurrect a canceled task");
    }
}
