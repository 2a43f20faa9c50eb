//! # TaskGate CLI
//!
//! Usage:
//!   taskgate push --description "reply to Ana" --lane user --session tg:42
//!   taskgate next --claim                  # Take the next eligible task
//!   taskgate status <ID> completed
//!   taskgate check --batch ops.json --context run.json
//!   taskgate serve                         # Timers + event log until Ctrl-C

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use taskgate_core::TaskGateConfig;
use taskgate_guardrails::{GuardrailPipeline, ProposedOperation, RunContext};
use taskgate_scheduler::{Lane, RetryPolicy, Scheduler, Task, TaskStatus};

#[derive(Parser)]
#[command(
    name = "taskgate",
    version,
    about = "🚦 TaskGate — durable task scheduling and guardrails for agents"
)]
struct Cli {
    /// Config file (default: ~/.taskgate/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a new task
    Push {
        #[arg(short, long)]
        description: String,
        #[arg(short, long, default_value = "user")]
        lane: Lane,
        #[arg(short, long, default_value = "0")]
        priority: i64,
        /// Session scope; one active task per scope
        #[arg(short, long)]
        session: Option<String>,
        /// Run only after this task completes
        #[arg(long)]
        after: Option<String>,
        /// Automatic retries on failure
        #[arg(long, default_value = "0")]
        retries: u32,
        /// Base backoff delay in seconds
        #[arg(long, default_value = "60")]
        retry_delay: u64,
    },
    /// Show (or claim) the next eligible task
    Next {
        #[arg(short, long)]
        lane: Option<Lane>,
        /// Mark it in-progress
        #[arg(long)]
        claim: bool,
    },
    /// Change a task's status
    Status { id: String, status: TaskStatus },
    /// List all tasks
    List,
    /// Per-lane counts
    Stats,
    /// Run one maintenance sweep
    Maintain,
    /// Run a proposed batch through the guardrail pipeline
    Check {
        /// JSON array of operations
        #[arg(long)]
        batch: PathBuf,
        /// JSON run context
        #[arg(long)]
        context: PathBuf,
    },
    /// Start timers and log scheduler events until Ctrl-C
    Serve,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskgate=debug,taskgate_scheduler=debug,taskgate_guardrails=debug"
    } else {
        "taskgate=info,taskgate_scheduler=info,taskgate_guardrails=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => TaskGateConfig::load_from(path)?,
        None => TaskGateConfig::load()?,
    };

    let open = || -> Result<Arc<Scheduler>> { Ok(Arc::new(Scheduler::open(config.scheduler.clone())?)) };

    match cli.command {
        Commands::Push {
            description,
            lane,
            priority,
            session,
            after,
            retries,
            retry_delay,
        } => {
            let scheduler = open()?;
            let mut task = Task::new(&description, lane)
                .priority(priority)
                .retry(RetryPolicy::new(retries, retry_delay));
            if let Some(session) = &session {
                task = task.session(session);
            }
            let id = match after {
                Some(parent) => scheduler.push_after(&parent, task).await?,
                None => scheduler.push(task).await?,
            };
            println!("{id}");
        }
        Commands::Next { lane, claim } => {
            let scheduler = open()?;
            let task = if claim {
                scheduler.claim_next(lane).await?
            } else {
                scheduler.get_next(lane).await
            };
            match task {
                Some(task) => print_json(&task)?,
                None => eprintln!("No eligible task"),
            }
        }
        Commands::Status { id, status } => {
            let task = open()?.update_status(&id, status).await?;
            print_json(&task)?;
        }
        Commands::List => print_json(&open()?.list().await)?,
        Commands::Stats => print_json(&open()?.stats().await)?,
        Commands::Maintain => print_json(&open()?.run_maintenance().await?)?,
        Commands::Serve => serve(open()?).await?,
        Commands::Check { batch, context } => {
            let pipeline = GuardrailPipeline::new(&config.guardrails)?;
            let batch: Vec<ProposedOperation> = read_json(&batch)?;
            let context: RunContext = read_json(&context)?;
            print_json(&pipeline.evaluate(batch, &context))?;
        }
    }

    Ok(())
}

async fn serve(scheduler: Arc<Scheduler>) -> Result<()> {
    let mut events = scheduler.subscribe();
    scheduler.start();
    tracing::info!(
        "🚦 TaskGate serving {}",
        scheduler.config().resolved_store_path().display()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("🛑 Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => tracing::info!("📣 {}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(n)) => tracing::warn!("⚠️ Dropped {n} scheduler events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.shutdown().await?;
    Ok(())
}
