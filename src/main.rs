//! CLI entry point (spec §6): a single command that drives one run end
//! to end.
//!
//! Generalizes the donor's `main.rs` subcommand tree into the flag set
//! spec §6 fixes, wires up `tracing`/`tracing-appender` the way the
//! donor's `main.rs` initialized its logging, and dispatches straight
//! into [`sq::driver::drive`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sq::agent::AgentRuntime;
use sq::callbacks::{Callbacks, NullCallbacks, PlainTextCallbacks, TuiCallbacks};
use sq::config::{Config, ConfigArgs};
use sq::driver;
use sq::effort::EffortLevel;
use sq::phase::PhaseContext;
use sq::scheduler::LoopScheduler;
use sq::store::RunStore;
use sq::stuck::StuckThresholds;
use sq::worktree::WorktreeManager;

/// Drives a fleet of coding agents through a specification end to end.
#[derive(Parser)]
#[command(name = "sq", version, about)]
struct Cli {
    /// Path to the specification file.
    #[arg(long)]
    spec: PathBuf,

    /// Selects review cadence, review depth, model tiers, max revisions,
    /// and cost limits from a fixed table.
    #[arg(long, default_value = "medium")]
    effort: EffortLevel,

    /// Upper bound on concurrent loops.
    #[arg(long, default_value_t = 4)]
    max_loops: usize,

    /// Per-loop iteration cap.
    #[arg(long, default_value_t = 50)]
    max_iterations: u32,

    /// Where durable state lives.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Load an existing run from state-dir instead of starting fresh.
    #[arg(long)]
    resume: bool,

    /// Delete state-dir and start fresh.
    #[arg(long)]
    reset: bool,

    /// Print the plan summary after the plan phase and exit.
    #[arg(long)]
    dry_run: bool,

    /// Stream plain text instead of the terminal UI.
    #[arg(long)]
    no_tui: bool,

    /// Disable git-worktree isolation.
    #[arg(long)]
    no_worktrees: bool,

    /// Emit structured trace JSON under `<state-dir>/debug/<runId>/`.
    #[arg(long)]
    debug: bool,
}

/// `--debug` emits structured trace JSON to `<state-dir>/debug/<runId>/
/// trace.json` (spec §6 "Persisted layout"); otherwise plain compact
/// lines go to stderr.
fn init_tracing(debug: bool, trace_path: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    if !debug {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
        return None;
    }

    let dir = trace_path.parent().unwrap_or(trace_path);
    let _ = std::fs::create_dir_all(dir);
    let file_name = trace_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("trace.json"));
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_env_filter(filter).json().with_writer(non_blocking).init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let project_dir = std::env::current_dir()?;

    let config = Config::new(
        project_dir.clone(),
        ConfigArgs {
            spec_path: cli.spec.clone(),
            effort: Some(cli.effort),
            max_loops: Some(cli.max_loops),
            max_iterations: Some(cli.max_iterations),
            state_dir: cli.state_dir.clone(),
            resume: cli.resume,
            reset: cli.reset,
            dry_run: cli.dry_run,
            no_tui: cli.no_tui,
            no_worktrees: cli.no_worktrees,
            debug: cli.debug,
        },
    )?;

    let spec_text = std::fs::read_to_string(&config.spec_path)?;
    let store = Arc::new(RunStore::open(&config.db_path())?);
    let run = driver::load_or_init_run(&config, &store, &spec_text)?;

    let _trace_guard = init_tracing(config.debug, &config.debug_trace_path(&run.id));

    let worktrees = Arc::new(WorktreeManager::open(&project_dir, &config.state_dir, !config.no_worktrees)?);
    let agent = Arc::new(AgentRuntime::new(config.agent_cmd.clone(), Duration::from_secs(300)));
    let model = driver::model_for(config.effort).to_string();

    let callbacks: Arc<dyn Callbacks> = if config.no_tui {
        Arc::new(PlainTextCallbacks)
    } else if atty_is_terminal() {
        Arc::new(TuiCallbacks::new())
    } else {
        Arc::new(NullCallbacks)
    };

    let scheduler = Arc::new(LoopScheduler {
        store: Arc::clone(&store),
        worktrees: Arc::clone(&worktrees),
        agent: Arc::clone(&agent),
        max_loops: config.max_loops,
        max_turns_per_iteration: 40,
        model: model.clone(),
        thresholds: StuckThresholds::default(),
    });

    let ctx = PhaseContext {
        store: Arc::clone(&store),
        agent: Arc::clone(&agent),
        worktrees: Arc::clone(&worktrees),
        scheduler,
        callbacks,
        project_dir: project_dir.clone(),
        spec_text,
        model,
        max_turns: 40,
    };

    let interrupt_store = Arc::clone(&store);
    let interrupt_run_id = run.id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = driver::mark_interrupted(&interrupt_run_id, &interrupt_store);
            std::process::exit(130);
        }
    });

    let outcome = driver::drive(run, Arc::clone(&store), &ctx, config.dry_run).await?;

    if config.dry_run {
        print_dry_run_summary(&store, &outcome.run)?;
    }

    println!(
        "run {} finished in phase '{}' (exit {})",
        outcome.run.id,
        outcome.run.phase.as_str(),
        outcome.exit_code
    );
    std::process::exit(outcome.exit_code);
}

fn print_dry_run_summary(store: &RunStore, run: &sq::model::Run) -> anyhow::Result<()> {
    let tasks = store.load_tasks(&run.id)?;
    let groups = store.load_plan_groups(&run.id)?;
    println!("\n== dry run: plan summary ==");
    println!("{} tasks across {} parallel groups", tasks.len(), groups.len());
    for (i, group) in groups.iter().enumerate() {
        println!("  group {i}: {}", group.join(", "));
    }
    Ok(())
}

fn atty_is_terminal() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal()
}
