//! Pipeline Engine Binary
//!
//! `serve` runs the scheduler process; `worker` is the hidden entry point
//! the scheduler re-invokes for each spawned worker. Both subcommands load
//! the same configuration (the scheduler passes its config path to workers
//! through the environment) and connect their own store pool — nothing
//! crosses the process boundary except the heartbeat file and the queues.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use pipeline_core::config::ConfigManager;
use pipeline_core::engine::{Engine, WorkerInvocation};
use pipeline_core::feed::{DropDirProvider, IdentityTransform, OutboxSink};
use pipeline_core::logging;
use pipeline_core::store::PgJobStore;
use pipeline_core::tasks::WorkerLauncher;
use pipeline_core::Priority;

#[derive(Debug, Parser)]
#[command(
    name = "pipeline-engine",
    version,
    about = "Multi-stage job pipeline orchestrator",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler process.
    Serve {
        /// Path to the config file (TOML).
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Worker entry point; invoked by the scheduler, not by operators.
    #[command(hide = true)]
    Worker {
        /// Task slug to run.
        #[arg(long)]
        task: String,
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long)]
        request_dir: Option<PathBuf>,
        #[arg(long)]
        priority: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("pipeline-engine error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve { config } => serve(config).await,
        Command::Worker {
            task,
            request_id,
            request_dir,
            priority,
        } => {
            worker(
                task,
                WorkerInvocation {
                    request_id,
                    request_dir,
                    priority: priority.as_deref().map(Priority::parse),
                },
            )
            .await
        }
    }
}

async fn build_engine(config_path: Option<PathBuf>) -> anyhow::Result<Engine> {
    let manager = match config_path.clone() {
        Some(path) => ConfigManager::load_from_path(Some(path))?,
        None => ConfigManager::load()?,
    };
    let config = Arc::new(manager.config().clone());

    let store = PgJobStore::connect(&config.database).await?;
    store.initialize().await?;

    let config_path = config_path.or_else(|| manager.config_path().cloned());
    let engine = Engine::standard(
        config.clone(),
        Arc::new(store),
        Arc::new(DropDirProvider::new(config.feed.drop_dir.clone())),
        Arc::new(IdentityTransform),
        Arc::new(OutboxSink::new(config.feed.outbox_dir.clone())),
        WorkerLauncher::current_exe(config_path),
    )?;
    Ok(engine)
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = build_engine(config_path).await?;
    logging::init_structured_logging(&engine.config().pipeline.log_dir());
    info!("pipeline engine starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let scheduler = tokio::spawn({
        let engine = engine;
        async move { engine.run_scheduler(shutdown_rx).await }
    });

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    scheduler.await??;
    info!("pipeline engine stopped");
    Ok(())
}

async fn worker(slug: String, invocation: WorkerInvocation) -> anyhow::Result<()> {
    let engine = build_engine(None).await?;
    logging::init_worker_logging(&slug, &engine.config().pipeline.log_dir());
    engine.run_worker(&slug, invocation).await?;
    Ok(())
}
