//! `coworker-runtime`: the daemon-backed, durable command tree — submit,
//! inspect, approve, cancel, and run the continuous worker loop.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use coworker_cli::{CliError, new_task_id, resolve_config, task_record_json};
use coworker_core::plan::{build_preview, ensure_plan_hash, load_plan};
use coworker_runtime::CoworkerConfig;
use coworker_store::task_bundle::{BundlePaths, events, init_task_bundle};
use coworker_store::task_store::bundle_dir_for;
use coworker_store::{StoreError, TaskStore};
use coworker_types::TaskState;
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "coworker-runtime", about = "Submit, inspect, and run coworker tasks against the durable store")]
struct Cli {
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate, hash, and queue a plan as a new task.
    Submit {
        plan: PathBuf,
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List tasks, most recently updated first.
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Print one task's full record as JSON.
    Status { task_id: String },
    /// Print a task's `events.jsonl` verbatim.
    Logs { task_id: String },
    /// Record an approval for a task id or a bare plan hash.
    Approve {
        task_id_or_plan_hash: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Cancel a task.
    Cancel { task_id: String },
    /// Run the continuous claim/execute loop until interrupted.
    Daemon {
        #[arg(long = "poll-seconds")]
        poll_seconds: Option<u64>,
        #[arg(long = "workers")]
        workers: Option<usize>,
    },
    /// Print a fixed-shape launchd plist pointing at `coworker-runtime daemon`.
    PrintPlist,
}

fn main() -> ExitCode {
    if !coworker_runtime::runtime_enabled() {
        eprintln!("error: coworker-runtime is disabled (COWORKER_RUNTIME_ENABLED=0)");
        return ExitCode::from(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match runtime.block_on(run(Cli::parse())) {
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
        Command::Submit { plan, metadata } => cmd_submit(state_dir, &plan, metadata.as_deref()),
        Command::List { state, limit } => cmd_list(state_dir, state.as_deref(), limit),
        Command::Status { task_id } => cmd_status(state_dir, &task_id),
        Command::Logs { task_id } => cmd_logs(state_dir, &task_id),
        Command::Approve { task_id_or_plan_hash, by, checkpoint } => {
            cmd_approve(state_dir, &task_id_or_plan_hash, &by, checkpoint.as_deref())
        }
        Command::Cancel { task_id } => cmd_cancel(state_dir, &task_id),
        Command::Daemon { poll_seconds, workers } => cmd_daemon(state_dir, poll_seconds, workers).await,
        Command::PrintPlist => cmd_print_plist(resolve_config(state_dir)?),
    }
}

fn cmd_submit(state_dir: Option<PathBuf>, path: &std::path::Path, metadata: Option<&str>) -> Result<(), CliError> {
    let mut plan = load_plan(path).map_err(CliError::from)?;
    let plan_hash = ensure_plan_hash(&mut plan);
    let config = resolve_config(state_dir)?;

    let task_id = new_task_id();
    let bundle_path = bundle_dir_for(&config.state_dir, &task_id);
    let bundle_paths = BundlePaths::new(bundle_path.clone());
    let preview = build_preview(&plan);
    init_task_bundle(&bundle_paths, &mut plan, &preview)?;
    coworker_store::append_event(&bundle_paths, events::task_created())?;

    let metadata = parse_metadata(metadata)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    let task = store
        .create_task(&task_id, &plan_hash, &bundle_paths.plan_path, &bundle_path, metadata)
        .map_err(CliError::from)?;

    println!("{}", task.id);
    Ok(())
}

fn parse_metadata(raw: Option<&str>) -> Result<Map<String, Value>, CliError> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    let value: Value = serde_json::from_str(raw).map_err(|e| CliError::User(format!("invalid --metadata json: {e}")))?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| CliError::User("--metadata must be a JSON object".to_string()))
}

fn cmd_list(state_dir: Option<PathBuf>, state: Option<&str>, limit: i64) -> Result<(), CliError> {
    let config = resolve_config(state_dir)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    let state = state
        .map(|s| TaskState::parse(s).ok_or_else(|| CliError::User(format!("unknown task state '{s}'"))))
        .transpose()?;
    let tasks = store.list_tasks(state, limit, 0).map_err(CliError::from)?;
    for task in tasks {
        println!("{}\t{}\t{}\t{}", task.id, task.state.as_str(), task.updated_at, task.plan_hash);
    }
    Ok(())
}

fn cmd_status(state_dir: Option<PathBuf>, task_id: &str) -> Result<(), CliError> {
    let config = resolve_config(state_dir)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    let task = store.get_task(task_id).map_err(CliError::from)?;
    println!("{}", serde_json::to_string_pretty(&task_record_json(&task)).expect("json always serializes"));
    Ok(())
}

fn cmd_logs(state_dir: Option<PathBuf>, task_id: &str) -> Result<(), CliError> {
    let config = resolve_config(state_dir)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    let task = store.get_task(task_id).map_err(CliError::from)?;
    let bundle_paths = BundlePaths::new(PathBuf::from(&task.bundle_path));
    let text = std::fs::read_to_string(&bundle_paths.events_path)
        .map_err(|e| CliError::User(format!("failed to read {}: {e}", bundle_paths.events_path.display())))?;
    print!("{text}");
    Ok(())
}

fn cmd_approve(state_dir: Option<PathBuf>, task_id_or_plan_hash: &str, by: &str, checkpoint: Option<&str>) -> Result<(), CliError> {
    let config = resolve_config(state_dir)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    let plan_hash = match store.get_task(task_id_or_plan_hash) {
        Ok(task) => task.plan_hash,
        Err(StoreError::NotFound(_)) => task_id_or_plan_hash.to_string(),
        Err(other) => return Err(CliError::from(other)),
    };
    store
        .record_approval(&new_task_id(), &plan_hash, checkpoint, by)
        .map_err(CliError::from)?;
    println!("approved {plan_hash} checkpoint={checkpoint:?} by={by}");
    Ok(())
}

fn cmd_cancel(state_dir: Option<PathBuf>, task_id: &str) -> Result<(), CliError> {
    let config = resolve_config(state_dir)?;
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;
    store.get_task(task_id).map_err(CliError::from)?;
    coworker_runtime::cancel_task(&store, &config, task_id).map_err(CliError::from)?;
    println!("canceled {task_id}");
    Ok(())
}

async fn cmd_daemon(state_dir: Option<PathBuf>, poll_seconds: Option<u64>, workers: Option<usize>) -> Result<(), CliError> {
    let mut config = resolve_config(state_dir)?;
    if let Some(poll_seconds) = poll_seconds {
        config.poll_seconds = poll_seconds;
    }
    if let Some(workers) = workers {
        config.worker_count = workers;
    }

    coworker_runtime::init_tracing(&config.state_dir, None);
    let store = TaskStore::open(&config.state_dir.join("tasks.db")).map_err(CliError::from)?;

    tokio::select! {
        _ = coworker_runtime::run_loop(&store, &config, "daemon") => unreachable!("run_loop never returns"),
        () = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn cmd_print_plist(config: CoworkerConfig) -> Result<(), CliError> {
    let exe = std::env::current_exe().map_err(|e| CliError::User(format!("failed to resolve current executable: {e}")))?;
    let logs_dir = config.state_dir.join("logs");
    println!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>com.coworker.runtime</string>
    <key>ProgramArguments</key>
    <array>
        <string>{}</string>
        <string>daemon</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{}</string>
    <key>StandardErrorPath</key>
    <string>{}</string>
</dict>
</plist>"#,
        exe.display(),
        logs_dir.join("coworker.out.log").display(),
        logs_dir.join("coworker.err.log").display(),
    );
    Ok(())
}
