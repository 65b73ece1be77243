use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kiln::budget::BudgetTracker;
use kiln::commit::CommitSerializer;
use kiln::config::Config;
use kiln::orchestration::{
    relay_events, stdin_lines, ClaudeCli, EventSink, GateKeeper, RunResult, Scheduler,
    TaskExecutor,
};
use kiln::plan::Plan;
use kiln::workspace::Workspace;
use kiln::Result;

/// Kiln - run a task plan against AI coding agents
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KILN_DEBUG=1     Enable debug logging (alternative to --debug)\n    KILN_LOG=<filter> tracing filter directive, e.g. kiln=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.kiln/kiln.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan, streaming events as JSON lines
    Run {
        /// Plan file (JSON)
        plan: PathBuf,

        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Token ceiling for the whole run
        #[arg(long)]
        budget: Option<u64>,

        /// Pause for approval once half the tasks have settled
        #[arg(long)]
        midpoint_gate: bool,

        /// Do not record commits
        #[arg(long)]
        no_git: bool,

        /// Config file (defaults to ~/.kiln/kiln.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a plan and print its tasks in dependency order
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    kiln::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            plan,
            workspace,
            budget,
            midpoint_gate,
            no_git,
            config,
        } => {
            let mut config = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };
            if budget.is_some() {
                config.token_budget = budget;
            }
            if midpoint_gate {
                config.midpoint_gate = true;
            }
            if no_git {
                config.use_git = false;
            }
            config.validate()?;

            let workspace = match workspace {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let rt = tokio::runtime::Runtime::new()?;
            let result = rt.block_on(run_plan(&plan, &workspace, config));
            // The stdin reader may still be parked on a blocking read.
            rt.shutdown_background();
            result.map(|_| ())
        }
        Command::Validate { plan } => validate_plan(&plan),
    }
}

fn validate_plan(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let dag = plan.to_dag()?;
    println!("Plan OK: {} task(s), {} dependency edge(s)", dag.task_count(), dag.dependency_count());
    for (i, task) in dag.topological_order()?.into_iter().enumerate() {
        let deps: Vec<&str> = task.dependencies.iter().map(|d| d.as_str()).collect();
        if deps.is_empty() {
            println!("  {:>2}. {} - {}", i + 1, task.id, task.display_name());
        } else {
            println!(
                "  {:>2}. {} - {} (after {})",
                i + 1,
                task.id,
                task.display_name(),
                deps.join(", ")
            );
        }
    }
    Ok(())
}

async fn run_plan(plan_path: &Path, workspace_dir: &Path, config: Config) -> Result<RunResult> {
    let plan = Plan::load(plan_path)?;
    let dag = plan.to_dag()?;
    tracing::info!(plan = %plan_path.display(), tasks = dag.task_count(), "plan loaded");

    tokio::fs::create_dir_all(workspace_dir).await?;
    let workspace = Workspace::new(workspace_dir);
    workspace.setup().await?;

    let agent = ClaudeCli::new(&config.agent_command, workspace.root())?
        .with_timeout(config.agent_timeout());
    let (events, rx) = EventSink::channel();
    let gates = GateKeeper::new();
    let cancel = CancellationToken::new();

    let mut executor = TaskExecutor::new(workspace.clone(), Arc::new(agent), events)
        .with_config(&config)
        .with_goal(&plan.goal)
        .with_guidance(plan.skills.clone(), plan.rules.clone())
        .with_budget(BudgetTracker::with_warning_ratio(
            config.token_budget,
            config.warning_ratio,
        ))
        .with_gates(Arc::clone(&gates))
        .with_cancel(cancel.clone());
    if let Some(ref servers) = plan.mcp_servers {
        executor = executor.with_mcp_servers(servers.clone());
    }
    if config.use_git {
        if let Some(git) = workspace.open_or_init_git(&plan.goal) {
            executor = executor.with_commits(Arc::new(CommitSerializer::new(Arc::new(git))));
        }
    }

    let mut scheduler = Scheduler::new(dag.into_shared(), plan.resolved_workers(), executor)
        .with_config(&config)
        .with_midpoint_gate(config.midpoint_gate || plan.gates_enabled());

    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let stop = cancel.child_token();
    let printer = tokio::spawn(relay_events(
        rx,
        gates,
        stdin_lines(),
        stop.clone(),
        std::io::stdout(),
    ));

    let result = scheduler.run().await;
    drop(scheduler);
    ctrl_c.abort();
    stop.cancel();
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer ended abnormally");
    }
    result
}
