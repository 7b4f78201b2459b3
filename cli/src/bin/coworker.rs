//! `coworker`: one-shot subcommands that work on a plan file directly, no
//! daemon and (except for `approve`) no task store.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use coworker_cli::{CliError, new_task_id, resolve_config};
use coworker_core::executor::{apply_plan_with_state, preview_plan};
use coworker_core::plan::{auto_checkpoints, build_preview, compute_plan_hash, ensure_plan_fields, ensure_plan_hash, load_plan};
use coworker_store::TaskStore;
use coworker_types::{ApprovalRecord, Plan, ResumeState};

#[derive(Parser)]
#[command(name = "coworker", about = "Validate, preview, and run coworker plans without a daemon")]
struct Cli {
    /// Override the runtime state directory (where `tasks.db`/`config.toml` live).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stamp a plan file with its canonical hash and print or write it back out.
    Plan {
        plan: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print one preview line per tool call.
    Summarize { plan: PathBuf },
    /// Validate a plan and print its preview, optionally with write diffs.
    Preview {
        plan: PathBuf,
        #[arg(long)]
        diffs: bool,
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },
    /// Print the checkpoint ids `auto_checkpoints` would assign.
    Checkpoints {
        plan: PathBuf,
        #[arg(long, default_value_t = 1)]
        every: i64,
    },
    /// Record an approval directly into the task store for this state dir.
    Approve {
        plan: PathBuf,
        #[arg(long)]
        by: String,
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Run `apply_plan_with_state` in-process and print the result lines.
    Apply {
        plan: PathBuf,
        #[arg(long = "resume-state")]
        resume_state: Option<PathBuf>,
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let state_dir = cli.state_dir;
    match cli.command {
        Command::Plan { plan, out } => cmd_plan(&plan, out.as_deref()),
        Command::Summarize { plan } => cmd_summarize(&plan),
        Command::Preview { plan, diffs, roots } => cmd_preview(state_dir, &plan, diffs, &roots).await,
        Command::Checkpoints { plan, every } => cmd_checkpoints(&plan, every),
        Command::Approve { plan, by, checkpoint } => cmd_approve(state_dir, &plan, &by, checkpoint.as_deref()),
        Command::Apply { plan, resume_state, roots } => cmd_apply(state_dir, &plan, resume_state.as_deref(), &roots).await,
    }
}

fn cmd_plan(path: &std::path::Path, out: Option<&std::path::Path>) -> Result<(), CliError> {
    let bytes = std::fs::read(path).map_err(|e| CliError::User(format!("failed to read {}: {e}", path.display())))?;
    let mut plan: Plan = serde_json::from_slice(&bytes).map_err(|e| CliError::User(format!("invalid plan json: {e}")))?;
    coworker_core::plan::validate_plan(&plan).map_err(|e| CliError::User(e.to_string()))?;
    ensure_plan_fields(&mut plan);
    ensure_plan_hash(&mut plan);
    let text = serde_json::to_string_pretty(&plan).map_err(|e| CliError::User(e.to_string()))?;
    match out {
        Some(out) => std::fs::write(out, text).map_err(|e| CliError::User(format!("failed to write {}: {e}", out.display())))?,
        None => println!("{text}"),
    }
    Ok(())
}

fn cmd_summarize(path: &std::path::Path) -> Result<(), CliError> {
    let plan = load_plan(path).map_err(CliError::from)?;
    for line in build_preview(&plan) {
        println!("{line}");
    }
    Ok(())
}

fn cmd_checkpoints(path: &std::path::Path, every: i64) -> Result<(), CliError> {
    let plan = load_plan(path).map_err(CliError::from)?;
    for id in auto_checkpoints(&plan.tool_calls, every) {
        println!("{id}");
    }
    Ok(())
}

async fn cmd_preview(state_dir: Option<PathBuf>, path: &std::path::Path, diffs: bool, roots: &[PathBuf]) -> Result<(), CliError> {
    let plan = load_plan(path).map_err(CliError::from)?;
    let config = resolve_config(state_dir)?;
    let policy = config.build_policy(&[], roots);
    let lines = preview_plan(&plan, &policy, diffs).await.map_err(|e| CliError::User(e.to_string()))?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn cmd_approve(state_dir: Option<PathBuf>, path: &std::path::Path, by: &str, checkpoint: Option<&str>) -> Result<(), CliError> {
    let plan = load_plan(path).map_err(CliError::from)?;
    let plan_hash = compute_plan_hash(&plan);
    let config = resolve_config(state_dir)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    store
        .record_approval(&new_task_id(), &plan_hash, checkpoint, by)
        .map_err(CliError::from)?;
    println!("approved {plan_hash} checkpoint={checkpoint:?} by={by}");
    Ok(())
}

async fn cmd_apply(state_dir: Option<PathBuf>, path: &std::path::Path, resume_state_path: Option<&std::path::Path>, roots: &[PathBuf]) -> Result<(), CliError> {
    let plan = load_plan(path).map_err(CliError::from)?;
    let config = resolve_config(state_dir)?;
    let policy = config.build_policy(&[], roots);

    let resume_state = resume_state_path
        .filter(|p| p.exists())
        .map(|p| std::fs::read_to_string(p).map_err(|e| CliError::User(format!("failed to read resume state: {e}"))))
        .transpose()?
        .map(|text| serde_json::from_str::<ResumeState>(&text).map_err(|e| CliError::User(format!("malformed resume state: {e}"))))
        .transpose()?;

    let approval = approval_from_plan(&plan);
    let stop_at_checkpoints = !plan.checkpoints.is_empty() && policy.require_approval;

    let (results, resumed) = apply_plan_with_state(&plan, &policy, approval.as_ref(), resume_state.as_ref(), stop_at_checkpoints)
        .await
        .map_err(|e| CliError::User(e.to_string()))?;

    for line in &results {
        println!("{line}");
    }

    if let Some(resume) = resumed {
        let text = serde_json::to_string_pretty(&resume).map_err(|e| CliError::User(e.to_string()))?;
        match resume_state_path {
            Some(out) => std::fs::write(out, &text).map_err(|e| CliError::User(format!("failed to write {}: {e}", out.display())))?,
            None => println!("paused at checkpoint; resume state:\n{text}"),
        }
    }
    Ok(())
}

/// One-shot `apply` has no task store, so an approval is read straight off
/// the plan's own `approval` field rather than looked up anywhere.
fn approval_from_plan(plan: &Plan) -> Option<ApprovalRecord> {
    let value = plan.approval.as_ref()?;
    let plan_hash = value.get("plan_hash")?.as_str()?.to_string();
    let checkpoint_id = value.get("checkpoint_id").and_then(serde_json::Value::as_str).map(str::to_owned);
    let approved_by = value.get("approved_by").and_then(serde_json::Value::as_str).unwrap_or("unknown").to_string();
    let approved_at = value
        .get("approved_at")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(coworker_cli::utc_now);
    Some(ApprovalRecord { id: new_task_id(), plan_hash, checkpoint_id, approved_at, approved_by })
}
