//! SchemaFlow CLI - agent workflow runs for schema design
//!
//! Usage:
//!   schemaflow init                       Write default configuration
//!   schemaflow serve [--port N]           Serve the streaming HTTP API
//!   schemaflow run --message <text>       Run the pipeline, frames on stdout
//!   schemaflow resume <thread>            Continue from the latest checkpoint
//!   schemaflow replay <thread>            Replay the latest checkpoint

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use schemaflow_agent::{Agent, CircuitBreaker, HttpAgent};
use schemaflow_core::{FlowError, RunRequest, WorkflowConfig};
use schemaflow_orchestrator::{
    guard, replay, AgentSet, CheckpointStore, FileCheckpointStore, MemoryRepository, Orchestrator,
    RunStart,
};
use schemaflow_stream::{pump, AppState, EventSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schemaflow")]
#[command(author, version, about = "Agent workflow orchestration for schema design")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding .schemaflow/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write .schemaflow/config.toml with defaults
    Init,

    /// Serve the streaming HTTP API
    Serve {
        /// Port (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Start a new run and stream its events to stdout
    Run {
        /// Natural-language request
        #[arg(short, long)]
        message: String,

        /// Thread id (generated when omitted)
        #[arg(long)]
        thread: Option<String>,

        /// JSON file with the current schema snapshot
        #[arg(long, value_name = "FILE")]
        schema: Option<PathBuf>,

        #[arg(long, default_value = "local")]
        organization: String,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Resume a thread from its latest checkpoint
    Resume {
        thread: String,
    },

    /// Replay the latest checkpoint of a thread without calling agents
    Replay {
        thread: String,
    },
}

/// Writes frames straight to stdout
struct StdoutSink(tokio::io::Stdout);

#[async_trait]
impl EventSink for StdoutSink {
    async fn send(&mut self, frame: String) -> schemaflow_core::Result<()> {
        self.0
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))?;
        self.0
            .flush()
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only frames
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = cli.root;
    match cli.command {
        Commands::Init => cmd_init(&root).await,
        Commands::Serve { port } => cmd_serve(&root, port).await,
        Commands::Run {
            message,
            thread,
            schema,
            organization,
            user,
        } => {
            let request = RunRequest {
                thread_id: thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                organization_id: organization,
                user_id: user,
                message,
            };
            cmd_run(&root, request, schema).await
        }
        Commands::Resume { thread } => cmd_resume(&root, thread).await,
        Commands::Replay { thread } => cmd_replay(&root, thread).await,
    }
}

async fn cmd_init(root: &Path) -> Result<()> {
    info!("Initializing SchemaFlow in {:?}", root);

    let path = WorkflowConfig::write_default(root).context("Failed to write configuration")?;
    let config = WorkflowConfig::load_or_default(root)?;
    let checkpoints = config.checkpoint_dir(root);
    tokio::fs::create_dir_all(&checkpoints)
        .await
        .with_context(|| format!("Failed to create {:?}", checkpoints))?;

    println!("Initialized SchemaFlow in {:?}", root);
    println!("Created:");
    println!("  {}", path.display());
    println!("  {}/", checkpoints.display());
    Ok(())
}

fn load_config(root: &Path) -> Result<WorkflowConfig> {
    WorkflowConfig::load_or_default(root).context("Failed to load .schemaflow/config.toml")
}

fn http_agents(config: &WorkflowConfig) -> Result<AgentSet> {
    let breaker = Arc::new(CircuitBreaker::default());
    let agent = |name: &str| -> Result<Arc<dyn Agent>> {
        Ok(Arc::new(
            HttpAgent::new(name, &config.agent)?.with_breaker(breaker.clone()),
        ))
    };

    Ok(AgentSet {
        analyst: agent("analyst")?,
        testcase_generator: agent("testcase-generator")?,
        schema_designer: agent("schema-designer")?,
        dml_generator: agent("dml-generator")?,
        qa_validator: agent("qa-validator")?,
    })
}

fn build_orchestrator(
    root: &Path,
    config: &WorkflowConfig,
    repository: MemoryRepository,
) -> Result<Orchestrator> {
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(config.checkpoint_dir(root)));
    Ok(
        Orchestrator::new(http_agents(config)?, store, Arc::new(repository))
            .with_policy(config.retry.clone()),
    )
}

/// Cancellation token tripped by Ctrl-C
fn interrupt_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing current stage...");
            trigger.cancel();
        }
    });
    token
}

async fn stream_to_stdout(
    orchestrator: Arc<Orchestrator>,
    start: RunStart,
    config: &WorkflowConfig,
) -> Result<()> {
    let external = interrupt_signal();
    guard(
        move |signal| async move {
            let mut sink = StdoutSink(tokio::io::stdout());
            let events = orchestrator.stream(start, signal.clone());
            let report = pump(events, &mut sink, &signal).await?;
            info!(
                "Delivered {} events{}",
                report.forwarded,
                if report.aborted { " (aborted)" } else { "" }
            );
            Ok(())
        },
        config.stream.timeout(),
        &external,
    )
    .await?;
    Ok(())
}

async fn cmd_run(root: &Path, request: RunRequest, schema: Option<PathBuf>) -> Result<()> {
    let config = load_config(root)?;

    let mut repository = MemoryRepository::new();
    if let Some(file) = schema {
        let content = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read schema file {:?}", file))?;
        let snapshot: serde_json::Value =
            serde_json::from_str(&content).context("Failed to parse schema JSON")?;
        repository = repository.with_schema(request.thread_id.clone(), snapshot);
    }

    eprintln!("Thread: {}", request.thread_id);
    let orchestrator = Arc::new(build_orchestrator(root, &config, repository)?);
    stream_to_stdout(orchestrator, RunStart::New(request), &config).await
}

async fn cmd_resume(root: &Path, thread_id: String) -> Result<()> {
    let config = load_config(root)?;
    let orchestrator = Arc::new(build_orchestrator(root, &config, MemoryRepository::new())?);
    stream_to_stdout(orchestrator, RunStart::Resume { thread_id }, &config).await
}

async fn cmd_replay(root: &Path, thread_id: String) -> Result<()> {
    let config = load_config(root)?;
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(config.checkpoint_dir(root)));

    let mut sink = StdoutSink(tokio::io::stdout());
    pump(replay(store, thread_id), &mut sink, &CancellationToken::new()).await?;
    Ok(())
}

async fn cmd_serve(root: &Path, port: Option<u16>) -> Result<()> {
    let config = load_config(root)?;
    let port = port.unwrap_or(config.server.port);
    let addr = format!("0.0.0.0:{}", port);

    let orchestrator = build_orchestrator(root, &config, MemoryRepository::new())?;
    let state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        timeout: config.stream.timeout(),
    });

    println!("SchemaFlow listening on http://localhost:{}", port);
    println!("Press Ctrl+C to stop");
    schemaflow_stream::serve(state, &addr).await?;
    Ok(())
}
