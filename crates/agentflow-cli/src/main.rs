//! agentflow - phased multi-agent orchestration CLI
//!
//! ## Commands
//!
//! - `run`: Execute a request through phases 0-9
//! - `todos`: List, add or compact durable todos
//! - `registry`: Validate or list specialist descriptors
//!
//! Exit codes for `run`: 0 green, 1 run aborted, 2 audit failed, 3 internal error.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use agentflow_core::{
    AgentRegistry, Capability, DirectorySource, DryRunWorker, FsArtifactStore, OrchestratorConfig,
    PhaseController, PhaseStatus, RunOutcome, RunRequest, RunStatus, SpecialistDescriptor, WorkerSet,
};
use agentflow_core::telemetry::LogFormat;
use agentflow_todo::{TodoConfig, TodoState, TodoStore};

const EXIT_INTERNAL: u8 = 3;

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Phased multi-agent orchestration engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory of specialist descriptor files (`*.md`)
    #[arg(
        long,
        global = true,
        env = "AGENTFLOW_DESCRIPTORS",
        default_value = ".agentflow/agents"
    )]
    descriptors: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for [`OrchestratorConfig`]; anything unset falls back to the
/// environment and then to the defaults.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// Executor slots
    #[arg(long, global = true, env = "AGENTFLOW_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Specialist timeout in seconds when a descriptor declares none
    #[arg(long, global = true, env = "AGENTFLOW_DEFAULT_TIMEOUT_SECS")]
    default_timeout_secs: Option<u64>,

    /// Heartbeat interval in milliseconds
    #[arg(long, global = true, env = "AGENTFLOW_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: Option<u64>,

    /// Drain timeout on cancellation, in milliseconds
    #[arg(long, global = true, env = "AGENTFLOW_DRAIN_TIMEOUT_MS")]
    drain_timeout_ms: Option<u64>,

    /// Todo store directory
    #[arg(long, global = true, env = "AGENTFLOW_TODO_PATH")]
    todo_path: Option<PathBuf>,

    /// Independent auditor instances per role
    #[arg(long, global = true, env = "AGENTFLOW_AUDITOR_INSTANCES")]
    auditor_instances: Option<usize>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<OrchestratorConfig> {
        let mut config = OrchestratorConfig::from_env()?;
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(s) = self.default_timeout_secs {
            config.default_timeout = Duration::from_secs(s);
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.drain_timeout_ms {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(path) = &self.todo_path {
            config.todo_path = path.clone();
        }
        if let Some(n) = self.auditor_instances {
            config.auditor_instances = n;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a request file (YAML or JSON) through the phase pipeline
    Run {
        /// Path to the request file
        request: PathBuf,

        /// Answer every specialist with a deterministic success instead of
        /// running its command
        #[arg(long)]
        dry_run: bool,

        /// Write `<run-id>.json` and `<run-id>.md` reports here
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Content-addressed artifact store directory
        #[arg(long, default_value = ".agentflow/artifacts")]
        artifacts: PathBuf,
    },

    /// List todos, optionally filtered by state
    Todos {
        /// pending, in-progress, blocked, completed or abandoned
        #[arg(long)]
        state: Option<TodoState>,

        #[command(subcommand)]
        action: Option<TodoAction>,
    },

    /// Specialist registry commands
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
}

#[derive(Subcommand)]
enum TodoAction {
    /// Add a pending todo
    Add {
        description: String,

        /// Higher is claimed first
        #[arg(short, long, default_value_t = 0)]
        priority: u32,
    },

    /// Rewrite the snapshot and truncate the transition log
    Compact,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Parse every descriptor and report the first error
    Validate,
    /// List registered specialists
    List {
        /// Only specialists requiring this capability (e.g. may-write-files)
        #[arg(long)]
        capability: Option<Capability>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    agentflow_core::telemetry::init_tracing(LogFormat::from_json_flag(cli.json), level);

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Run {
            request,
            dry_run,
            report_dir,
            artifacts,
        } => {
            let config = cli.config.resolve()?;
            let opts = RunOptions {
                descriptors: cli.descriptors,
                artifacts,
                report_dir,
                dry_run,
            };
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, draining running instances");
                    on_signal.cancel();
                }
            });
            cmd_run(&request, &opts, config, cancel).await
        }
        Commands::Todos { state, action } => {
            let config = cli.config.resolve()?;
            match action {
                None => Ok(cmd_todos_list(&config, state).await),
                Some(TodoAction::Add {
                    description,
                    priority,
                }) => cmd_todos_add(&config, &description, priority).await,
                Some(TodoAction::Compact) => cmd_todos_compact(&config).await,
            }
        }
        Commands::Registry { action } => match action {
            RegistryAction::Validate => Ok(cmd_registry_validate(&cli.descriptors)),
            RegistryAction::List { capability } => cmd_registry_list(&cli.descriptors, capability),
        },
    }
}

struct RunOptions {
    descriptors: PathBuf,
    artifacts: PathBuf,
    report_dir: Option<PathBuf>,
    dry_run: bool,
}

fn todo_config(config: &OrchestratorConfig) -> TodoConfig {
    TodoConfig {
        lease_timeout: config.todo_lease,
        ..TodoConfig::default()
    }
}

async fn cmd_run(
    request_path: &Path,
    opts: &RunOptions,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) -> Result<u8> {
    let request = match RunRequest::from_file(request_path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("✗ {} [{}]", e, e.kind());
            return Ok(RunStatus::RunAborted.exit_code() as u8);
        }
    };

    let registry = match AgentRegistry::from_source(&DirectorySource::new(&opts.descriptors)) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("✗ {} [{}]", e, e.kind());
            return Ok(RunStatus::RunAborted.exit_code() as u8);
        }
    };

    let mut workers = WorkerSet::new();
    if opts.dry_run {
        for descriptor in registry.list(|_| true) {
            workers = workers.with(descriptor.id.clone(), DryRunWorker::default());
        }
        workers = workers.with_fallback(DryRunWorker::default());
    }

    let artifacts = Arc::new(
        FsArtifactStore::new(&opts.artifacts)
            .with_context(|| format!("open artifact store {:?}", opts.artifacts))?,
    );
    let todos = TodoStore::open(&config.todo_path, todo_config(&config))
        .await
        .with_context(|| format!("open todo store {:?}", config.todo_path))?;

    info!(
        goal = %request.goal,
        specialists = registry.snapshot().len(),
        dry_run = opts.dry_run,
        "starting run"
    );

    let mut controller = PhaseController::new(config, registry, workers, artifacts).with_todos(todos);
    if let Some(dir) = &opts.report_dir {
        controller = controller.with_report_dir(dir);
    }

    let outcome = controller.run(request, cancel).await;
    print_outcome(&outcome, opts.report_dir.as_deref());
    Ok(outcome.exit_code() as u8)
}

fn print_outcome(outcome: &RunOutcome, report_dir: Option<&Path>) {
    let mark = if outcome.status == RunStatus::Green { "✓" } else { "✗" };
    println!("{} {} {}", mark, outcome.run_id, outcome.status);
    for p in &outcome.report.phases {
        let status = match p.status {
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Skipped => "skipped",
        };
        match &p.reason {
            Some(reason) => println!("  {} {:<16} {:<8} {}", p.phase, p.name, status, reason),
            None => println!("  {} {:<16} {:<8} ({} dispatched)", p.phase, p.name, status, p.dispatched),
        }
    }
    if let Some(kind) = outcome.error_kind {
        println!("  error: {} {}", kind, outcome.message.as_deref().unwrap_or(""));
    }
    if let Some(digest) = &outcome.report_ref {
        println!("  report: {}", digest);
    }
    if let Some(dir) = report_dir {
        println!("  written: {}", dir.join(format!("{}.md", outcome.run_id)).display());
    }
}

/// Lists todos. Problems opening the store are reported but never fail the command.
async fn cmd_todos_list(config: &OrchestratorConfig, state: Option<TodoState>) -> u8 {
    let store = match TodoStore::open(&config.todo_path, todo_config(config)).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot open todo store {:?}: {}", config.todo_path, e);
            return 0;
        }
    };

    let todos = store.list(state);
    if todos.is_empty() {
        println!("No todos.");
        return 0;
    }
    for todo in todos {
        let owner = todo.owner.as_deref().unwrap_or("-");
        print!(
            "{}  {:<11} p{:<3} {:<16} {}",
            todo.id,
            todo.state.to_string(),
            todo.priority,
            owner,
            todo.description
        );
        if let Some(reason) = &todo.reason {
            print!("  ({})", reason);
        }
        println!();
    }
    0
}

async fn cmd_todos_add(config: &OrchestratorConfig, description: &str, priority: u32) -> Result<u8> {
    let store = TodoStore::open(&config.todo_path, todo_config(config)).await?;
    let todo = store.add(description, priority, None, None).await?;
    println!("✓ Added todo {}", todo.id);
    Ok(0)
}

async fn cmd_todos_compact(config: &OrchestratorConfig) -> Result<u8> {
    let store = TodoStore::open(&config.todo_path, todo_config(config)).await?;
    store.compact().await?;
    println!("✓ Compacted {:?} ({} todos)", config.todo_path, store.snapshot().todos.len());
    Ok(0)
}

fn cmd_registry_validate(dir: &Path) -> u8 {
    match AgentRegistry::from_source(&DirectorySource::new(dir)) {
        Ok(registry) => {
            println!("✓ {} specialist(s) valid in {:?}", registry.snapshot().len(), dir);
            0
        }
        Err(e) => {
            println!("✗ {}", e);
            1
        }
    }
}

fn listed_specialists(dir: &Path, capability: Option<Capability>) -> Result<Vec<Arc<SpecialistDescriptor>>> {
    let registry = AgentRegistry::from_source(&DirectorySource::new(dir))?;
    Ok(registry.list(|d| capability.map_or(true, |cap| d.has_capability(cap))))
}

fn cmd_registry_list(dir: &Path, capability: Option<Capability>) -> Result<u8> {
    let specialists = listed_specialists(dir, capability)?;
    if specialists.is_empty() {
        println!("No specialists registered.");
        return Ok(0);
    }
    for d in specialists {
        let mandatory = if d.mandatory { " mandatory" } else { "" };
        let sequential = if d.parallel_safe { "" } else { " sequential" };
        let caps: Vec<String> = d.required_capabilities.iter().map(ToString::to_string).collect();
        println!(
            "{:<24} {:<16} timeout={:?} budget={} caps=[{}]{}{}",
            d.id,
            d.domain,
            d.timeout,
            d.token_budget,
            caps.join(","),
            mandatory,
            sequential
        );
    }
    Ok(0)
}
