#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Core
//!
//! Multi-stage job pipeline orchestrator: a scheduler that runs
//! independent and chained background tasks as isolated worker processes,
//! hands data between pipeline stages through a filesystem queue, tracks
//! per-job state in a durable store, and enforces liveness via heartbeats
//! with a watchdog that kills runaway workers.
//!
//! ## Architecture
//!
//! Actual task work executes in **separate OS processes**, never in the
//! scheduler: one stage's CPU- or I/O-bound work cannot stall the
//! scheduler or other stages, and a crashing worker cannot corrupt the
//! parent's state. A worker process re-establishes every external
//! resource handle (store connection, log file, heartbeat cell) on entry.
//!
//! Within a stage's input queue, requests are processed in
//! priority-then-FIFO order. Across stages the only synchronization point
//! is the atomic move of a request directory into the next stage's queue.
//! At most one worker process is alive per task at any time — the sole
//! concurrency-control primitive the orchestrator needs.
//!
//! ## Module Organization
//!
//! - [`tasks`] - task lifecycle, pipeline stages, registry, scheduler, watchdog
//! - [`process`] - worker process supervision and the heartbeat cell
//! - [`store`] - the job state store behind the narrow `JobStore` trait
//! - [`feed`] - collaborator traits: provider, transform, batch sink
//! - [`engine`] - assembly and the scheduler/worker entry points
//! - [`config`] - typed configuration with TOML + environment layering
//! - [`error`] - structured error handling
//! - [`logging`] - structured logging for scheduler and worker processes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipeline_core::config::ConfigManager;
//! use pipeline_core::engine::Engine;
//! use pipeline_core::feed::{DropDirProvider, IdentityTransform, OutboxSink};
//! use pipeline_core::store::MemoryJobStore;
//! use pipeline_core::tasks::WorkerLauncher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = Arc::new(manager.config().clone());
//!
//! let engine = Engine::standard(
//!     config.clone(),
//!     Arc::new(MemoryJobStore::new()),
//!     Arc::new(DropDirProvider::new(config.feed.drop_dir.clone())),
//!     Arc::new(IdentityTransform),
//!     Arc::new(OutboxSink::new(config.feed.outbox_dir.clone())),
//!     WorkerLauncher::current_exe(None),
//! )?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! engine.run_scheduler(shutdown_rx).await?;
//! # drop(shutdown_tx);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod feed;
pub mod logging;
pub mod process;
pub mod store;
pub mod tasks;

pub use config::{ConfigManager, EngineConfig};
pub use constants::Priority;
pub use engine::{Engine, WorkerInvocation};
pub use error::{EngineError, Result};
pub use process::{HeartbeatCell, ProcessMetadata, WorkerProcess};
pub use store::{JobRequest, JobStore, JobType, MemoryJobStore, PgJobStore, StoreError};
pub use tasks::{
    Scheduler, TaskRegistry, TaskSettings, TaskSnapshot, WorkerContext, WorkerLauncher,
};
