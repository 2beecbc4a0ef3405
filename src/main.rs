use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use waverun::cache::CacheStore;
use waverun::config::Config;
use waverun::orchestration::{
    CommandExecutor, CommandPolicy, DryRunReport, Engine, PlannedAction, RunEvent, RunOptions,
    RunResult, ShellVerifier,
};
use waverun::state::RunLedger;
use waverun::{Error, Plan, Result, Task, TaskDAG};

/// waverun - wave-based task scheduler with retries, caching and resume
#[derive(Parser, Debug)]
#[command(name = "waverun")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    WAVERUN_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG          Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Project root (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    pub project: Option<PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, Clone, PartialEq, Default)]
pub struct RunArgs {
    /// Plan file (JSON or TOML with a `tasks` list)
    #[arg(short, long, default_value = "plan.toml")]
    pub plan: PathBuf,

    /// Run independent tasks of a wave concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Worker limit in parallel mode
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Keep running unrelated tasks after a failure
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Disable the result cache entirely
    #[arg(long)]
    pub no_cache: bool,

    /// Ignore cached results (new results are still stored)
    #[arg(long)]
    pub force: bool,

    /// Retries per task after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Skip tasks a previous run already completed
    #[arg(long)]
    pub resume: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan wave by wave
    Run(RunArgs),

    /// Show what a run would do without executing anything
    DryRun(RunArgs),

    /// Show the latest outcome of every task and the resume point
    Status,

    /// Print the dependency graph and its waves
    Graph {
        /// Plan file (JSON or TOML with a `tasks` list)
        #[arg(short, long, default_value = "plan.toml")]
        plan: PathBuf,
    },

    /// Inspect or clear the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Delete the run ledger and resume point
    Reset,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CacheAction {
    /// Remove every cache entry
    Clear,
    /// Entry count and size on disk
    Stats,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    waverun::log::init_with_debug(cli.debug);

    let project = match &cli.project {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let config = Config::load(&project)?;
    debug!(project = %project.display(), "config loaded");

    match cli.command {
        Command::Run(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_plan(&project, &config, &args, cli.json))
        }
        Command::DryRun(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(dry_run(&project, &config, &args, cli.json))
        }
        Command::Status => run_status(&project, &config, cli.json),
        Command::Graph { plan } => run_graph(&project, &plan, cli.json),
        Command::Cache { action } => run_cache(&project, &config, action, cli.json),
        Command::Reset => {
            RunLedger::open(&config.ledger_dir(&project))?.reset()?;
            println!("Ledger reset");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Read a plan from JSON or TOML, chosen by file extension.
fn load_plan(project: &Path, path: &Path) -> Result<Vec<Task>> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project.join(path)
    };
    let text = fs::read_to_string(&path)?;
    let plan: Plan = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)?,
        _ => toml::from_str(&text)?,
    };
    debug!(path = %path.display(), tasks = plan.tasks.len(), "plan loaded");
    Ok(plan.tasks)
}

/// Merge CLI flags over config values.
fn run_options(config: &Config, args: &RunArgs) -> RunOptions {
    let mut config = config.clone();
    if args.parallel {
        config.parallel = true;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if args.continue_on_failure {
        config.continue_on_failure = true;
    }
    if args.no_cache {
        config.cache_enabled = false;
    }
    let mut options = config.run_options();
    options.force = args.force;
    options.resume = args.resume;
    options
}

fn build_engine(project: &Path, config: &Config, executor_command: String) -> Result<Engine> {
    let policy = CommandPolicy::with_patterns(&config.denylist)?;
    let executor = Arc::new(CommandExecutor::new(executor_command, project));
    let verifier = Arc::new(ShellVerifier::new(project, policy));
    let cache = Arc::new(CacheStore::open(&config.cache_dir(project))?);
    let ledger = Arc::new(RunLedger::open(&config.ledger_dir(project))?);
    Ok(Engine::new(executor, verifier, project)
        .with_cache(cache)
        .with_ledger(ledger))
}

async fn run_plan(project: &Path, config: &Config, args: &RunArgs, json: bool) -> Result<ExitCode> {
    let command = config.executor_command.clone().ok_or_else(|| {
        Error::Validation(format!(
            "executor_command is not set in {}",
            Config::project_config_path(project).display()
        ))
    })?;
    let tasks = load_plan(project, &args.plan)?;
    let options = run_options(config, args);

    let (tx, mut rx) = mpsc::channel(256);
    let engine = build_engine(project, config, command)?.with_events(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested, letting running tasks finish");
            ctrl_c.cancel();
        }
    });

    let result = engine.run(tasks, options, cancel).await;
    drop(engine);
    let _ = printer.await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn dry_run(project: &Path, config: &Config, args: &RunArgs, json: bool) -> Result<ExitCode> {
    let tasks = load_plan(project, &args.plan)?;
    let options = run_options(config, args);
    let command = config.executor_command.clone().unwrap_or_default();
    let report = build_engine(project, config, command)?
        .dry_run(tasks, &options)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_dry_run(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_status(project: &Path, config: &Config, json: bool) -> Result<ExitCode> {
    let status = RunLedger::open(&config.ledger_dir(project))?.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(ExitCode::SUCCESS);
    }

    if status.tasks.is_empty() {
        println!("No runs recorded");
        return Ok(ExitCode::SUCCESS);
    }
    println!("Tasks:");
    for (task_id, task_status) in &status.tasks {
        println!("  {:<8} {}", task_id, task_status);
    }
    println!();
    println!(
        "Succeeded: {}  Failed: {}  Skipped: {}  ({} records)",
        status.counts.succeeded, status.counts.failed, status.counts.skipped, status.total_records
    );
    if let Some(resume) = &status.resume {
        println!();
        println!("Resume point ({}):", resume.checkpoint);
        if let Some(last) = &resume.last_completed {
            println!("  Last completed: {}", last);
        }
        match &resume.next_pending {
            Some(next) => println!("  Next pending:   {}", next),
            None => println!("  Next pending:   none, all tasks done"),
        }
        if let Some(reason) = &resume.failure_reason {
            println!("  Last failure:   {}", reason);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_graph(project: &Path, plan: &Path, json: bool) -> Result<ExitCode> {
    let tasks = load_plan(project, plan)?;
    let dag = TaskDAG::build(&tasks)?;
    let waves = waverun::core::layer(&dag)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&waves)?);
        return Ok(ExitCode::SUCCESS);
    }
    println!("{}", dag.describe());
    println!();
    for wave in &waves {
        let ids: Vec<&str> = wave.task_ids.iter().map(|id| id.as_str()).collect();
        println!("Wave {}: {}", wave.number, ids.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_cache(project: &Path, config: &Config, action: CacheAction, json: bool) -> Result<ExitCode> {
    let cache = CacheStore::open(&config.cache_dir(project))?;
    match action {
        CacheAction::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} cache entries", removed);
        }
        CacheAction::Stats => {
            let stats = cache.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Cache: {}", cache.dir().display());
                println!("  Entries: {}", stats.entries);
                println!("  Size:    {} bytes", stats.total_bytes);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Progress goes to stderr so `--json` output stays clean.
fn print_event(event: &RunEvent) {
    match event {
        RunEvent::WaveStarted { wave, task_ids } => {
            eprintln!("== wave {} ({} tasks)", wave, task_ids.len());
        }
        RunEvent::TaskStarted { task_id, .. } => eprintln!("   {} started", task_id),
        RunEvent::TaskRetrying {
            task_id,
            attempt,
            kind,
            delay,
        } => eprintln!(
            "   {} retrying (attempt {}, {}) in {:?}",
            task_id, attempt, kind, delay
        ),
        RunEvent::TaskFinished {
            task_id, status, ..
        } => eprintln!("   {} {}", task_id, status),
        RunEvent::WaveFinished {
            wave,
            succeeded,
            failed,
            skipped,
        } => eprintln!(
            "== wave {} done: {} ok, {} failed, {} skipped",
            wave, succeeded, failed, skipped
        ),
        RunEvent::RunAborted { reason } => eprintln!("!! run aborted: {}", reason),
    }
}

fn print_result(result: &RunResult) {
    println!();
    println!("Run {}", result.run_id);
    for execution in &result.executions {
        let retries = if execution.retry_count > 0 {
            format!(" ({} retries)", execution.retry_count)
        } else {
            String::new()
        };
        println!("  {:<8} {}{}", execution.task_id, execution.status, retries);
        if let Some(error) = &execution.error {
            println!("           {}", error.kind);
        }
    }
    println!();
    println!(
        "Succeeded: {}  Failed: {}  Skipped: {}  in {:.1}s{}",
        result.succeeded,
        result.failed,
        result.skipped,
        result.duration().as_secs_f64(),
        if result.aborted { "  (aborted)" } else { "" }
    );
}

fn print_dry_run(report: &DryRunReport) {
    for wave in &report.waves {
        println!("Wave {}:", wave.number);
        for entry in report.entries.iter().filter(|e| e.wave == wave.number) {
            let action = match entry.action {
                PlannedAction::Run => "run",
                PlannedAction::Cached => "cached",
                PlannedAction::Resumed => "done",
            };
            println!("  {:<8} {}", entry.task_id, action);
        }
    }
    println!();
    println!(
        "{} to run, {} cached, {} already done",
        report.count(PlannedAction::Run),
        report.count(PlannedAction::Cached),
        report.count(PlannedAction::Resumed)
    );
}
