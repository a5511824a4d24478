//! CLI command definitions for stage-forge.
//!
//! Every command builds an [`EngineConfig`] from the environment, applies
//! its own flag overrides and works against the JSON file store under the
//! configured data directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::agents::{LlmStageAgent, StageKind};
use crate::engine::{AgentStageOperations, EngineConfig, OrchestrationEngine, StageOperations};
use crate::llm::{CompletionService, LiteLlmClient};
use crate::metrics::{export_metrics, init_metrics};
use crate::review::{FeedbackTracker, PeerReviewPipeline};
use crate::scheduler::EngineWorker;
use crate::store::{JsonFileStore, TaskFilter, TaskStore};
use crate::task::{Task, TaskStatus};

/// Peer-reviewed multi-stage task orchestration.
#[derive(Parser)]
#[command(name = "stage-forge")]
#[command(about = "Drive development tasks through peer-reviewed generation stages")]
#[command(version)]
#[command(
    long_about = "stage-forge moves development tasks through decomposition, implementation, testing, quality assessment and integration.\n\nEach stage reviews the output of the stage before it; rejected work is retried with the reviewer's feedback folded into the task description.\n\nExample usage:\n  stage-forge submit --description \"Add input validation to the parser\" --language rust\n  stage-forge run"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Directory holding the task store and feedback logs.
    #[arg(long, env = "FORGE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Model used by every stage.
    #[arg(short, long, env = "FORGE_MODEL", global = true)]
    pub model: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the engine worker until interrupted.
    Run(RunArgs),

    /// Submit a new task, creating its project when needed.
    Submit(SubmitArgs),

    /// Run a single peer-review pass over a task and print the report.
    Review(ReviewArgs),

    /// Show one task, or list tasks.
    Status(StatusArgs),

    /// Spread priorities of pending tasks evenly over 0..=100.
    Rebalance,
}

/// Arguments for `stage-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `stage-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// What the task should accomplish.
    #[arg(short, long)]
    pub description: String,

    /// Target language of the generated code.
    #[arg(short = 'L', long, default_value = "python")]
    pub language: String,

    /// Priority in 0..=100; values outside are clamped.
    #[arg(short, long, default_value = "50")]
    pub priority: f64,

    /// Requirement the result must satisfy. Repeatable.
    #[arg(short, long = "requirement")]
    pub requirements: Vec<String>,

    /// Existing project to attach the task to.
    #[arg(long, conflicts_with = "project_name")]
    pub project: Option<String>,

    /// Name of a new project to create for the task.
    #[arg(long)]
    pub project_name: Option<String>,
}

/// Arguments for `stage-forge review`.
#[derive(Parser, Debug)]
pub struct ReviewArgs {
    /// Stored task to review.
    #[arg(long, conflicts_with = "description", required_unless_present = "description")]
    pub task: Option<String>,

    /// Ad-hoc task description, reviewed without being stored.
    #[arg(short, long)]
    pub description: Option<String>,

    /// Language of an ad-hoc task.
    #[arg(short = 'L', long, default_value = "python")]
    pub language: String,

    /// Comma-separated stage order (e.g. implement,test).
    #[arg(long, value_delimiter = ',')]
    pub stages: Vec<StageKind>,

    /// Retries allowed per stage; defaults to FORGE_MAX_RETRIES.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Arguments for `stage-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task to show. Lists tasks when omitted.
    pub task_id: Option<String>,

    /// Only list tasks in this status (e.g. ready_for_testing).
    #[arg(long)]
    pub status: Option<TaskStatus>,

    /// Include completed and failed tasks in the listing.
    #[arg(long)]
    pub all: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the command selected in `cli`.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    match cli.command {
        Commands::Run(args) => run_engine(config, args).await,
        Commands::Submit(args) => submit_task(config, args).await,
        Commands::Review(args) => review_task(config, args).await,
        Commands::Status(args) => show_status(config, args).await,
        Commands::Rebalance => rebalance(config).await,
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("Invalid FORGE_* environment")?;
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir.clone());
    }
    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &EngineConfig) -> Arc<TaskStore> {
    let backend = JsonFileStore::new(config.tasks_dir());
    Arc::new(TaskStore::new(Arc::new(backend)))
}

fn completion_service() -> anyhow::Result<Arc<dyn CompletionService>> {
    let client = LiteLlmClient::from_env().context("LITELLM_API_BASE must be set")?;
    info!(
        api_base = client.api_base(),
        default_model = client.default_model(),
        "Using LiteLLM completion service"
    );
    Ok(Arc::new(client))
}

async fn run_engine(config: EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics unavailable");
    }

    let service = completion_service()?;
    let agents = LlmStageAgent::for_stages(&StageKind::ALL, service, &config.model_params());
    let operations: Arc<dyn StageOperations> = Arc::new(AgentStageOperations::from_agents(agents));

    let store = open_store(&config);
    let engine = Arc::new(OrchestrationEngine::new(config, store, operations));
    let queued = engine.load_pending().await?;
    info!(queued, "Engine ready");

    let mut worker = EngineWorker::new(Arc::clone(&engine));
    worker.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Interrupt received, shutting down");

    worker.shutdown().await?;
    let stats = worker.stats();
    info!(
        advanced = stats.advanced,
        waiting = stats.waiting,
        skipped = stats.skipped,
        faulted = stats.faulted,
        "Worker stopped"
    );

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn submit_task(config: EngineConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let store = open_store(&config);
    let engine = OrchestrationEngine::new(config, store, Arc::new(AgentStageOperations::new()));

    let project_id = match args.project {
        Some(id) => id,
        None => {
            let name = args
                .project_name
                .unwrap_or_else(|| args.description.chars().take(60).collect());
            engine.create_project(name, args.description.clone()).await?.id
        }
    };

    let task = Task::new(args.description, args.language)
        .with_priority(args.priority)
        .with_requirements(args.requirements)
        .with_project(project_id);
    let task = engine.create_task(task).await?;

    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn review_task(config: EngineConfig, args: ReviewArgs) -> anyhow::Result<()> {
    let task = match (&args.task, args.description) {
        (Some(task_id), _) => open_store(&config)
            .get(task_id)
            .await?
            .with_context(|| format!("Task not found: {}", task_id))?,
        (None, Some(description)) => Task::new(description, args.language),
        (None, None) => anyhow::bail!("Either --task or --description is required"),
    };

    let stages = if args.stages.is_empty() {
        StageKind::REVIEW_WORKFLOW.to_vec()
    } else {
        args.stages
    };

    let service = completion_service()?;
    let agents = LlmStageAgent::for_stages(&stages, service, &config.model_params());
    let tracker = Arc::new(FeedbackTracker::open(config.feedback_dir()).await?);
    let pipeline = PeerReviewPipeline::new(agents, tracker)
        .with_max_retries(args.max_retries.unwrap_or(config.max_retries));

    let report = pipeline.run(&task).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        anyhow::bail!(
            "Review failed at {}: {}",
            report.failed_at.as_deref().unwrap_or("start"),
            report.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn show_status(config: EngineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&config);

    if let Some(task_id) = args.task_id {
        let task = store
            .get(&task_id)
            .await?
            .with_context(|| format!("Task not found: {}", task_id))?;
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    let mut filter = if args.all {
        TaskFilter::all()
    } else {
        TaskFilter::pending()
    };
    if let Some(status) = args.status {
        filter = filter.with_status(status);
    }

    let mut tasks = store.warm(&filter).await?;
    tasks.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
    for task in &tasks {
        println!(
            "{}  {:<22} {:>6.1}  {}",
            task.id,
            task.status().as_str(),
            task.priority(),
            task.description.lines().next().unwrap_or_default()
        );
    }
    if tasks.is_empty() {
        println!("No tasks found");
    }
    Ok(())
}

async fn rebalance(config: EngineConfig) -> anyhow::Result<()> {
    let store = open_store(&config);
    let engine = OrchestrationEngine::new(config, store, Arc::new(AgentStageOperations::new()));
    engine.load_pending().await?;

    let updated = engine.rebalance_priorities(None).await?;
    println!("Rebalanced {} task(s)", updated);
    Ok(())
}
