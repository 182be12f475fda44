//! # Engine Assembly
//!
//! Wires configuration, store, collaborators, and tasks into a runnable
//! engine with two entry points: the scheduler loop for the parent process
//! and worker dispatch for spawned worker processes. Both sides build the
//! same registry from the same configuration, so a worker resolves its
//! task with identical pipeline wiring to the parent that spawned it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::{ensure_dir, EngineConfig};
use crate::constants::Priority;
use crate::error::{EngineError, Result};
use crate::feed::{BatchSink, FeedProvider, RecordTransform};
use crate::process::HeartbeatCell;
use crate::store::JobStore;
use crate::tasks::{
    run_pipe_task, run_standalone_task, Cleaner, ConvertStage, DownloadStage, PipeTask,
    ScheduleNextDownload, Scheduler, StageOutcome, StandaloneTask, TaskRegistry, TaskWork,
    UploadStage, WorkerContext, WorkerLauncher,
};

/// Arguments a worker process was invoked with.
#[derive(Debug, Clone, Default)]
pub struct WorkerInvocation {
    pub request_id: Option<String>,
    pub request_dir: Option<PathBuf>,
    pub priority: Option<Priority>,
}

/// Assembled engine: configuration, store, and the task registry.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
}

/// Builder for custom task sets. Most deployments use [`Engine::standard`].
pub struct EngineBuilder {
    config: Arc<EngineConfig>,
    store: Arc<dyn JobStore>,
    launcher: WorkerLauncher,
    pipelines: Vec<Vec<Arc<dyn PipeTask>>>,
    standalone: Vec<Arc<dyn StandaloneTask>>,
}

impl EngineBuilder {
    pub fn launcher(mut self, launcher: WorkerLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Add an ordered pipeline of stages.
    pub fn pipeline(mut self, stages: Vec<Arc<dyn PipeTask>>) -> Self {
        self.pipelines.push(stages);
        self
    }

    /// Add a standalone task.
    pub fn standalone(mut self, task: Arc<dyn StandaloneTask>) -> Self {
        self.standalone.push(task);
        self
    }

    pub fn build(self) -> Result<Engine> {
        ensure_dir(&self.config.pipeline.base_path)?;
        ensure_dir(&self.config.pipeline.heartbeat_dir())?;
        ensure_dir(&self.config.pipeline.log_dir())?;

        let mut registry =
            TaskRegistry::new(self.store.clone(), self.config.clone(), self.launcher);
        for stages in self.pipelines {
            registry.add_pipeline(stages)?;
        }
        for task in self.standalone {
            registry.add_standalone(task);
        }

        Ok(Engine {
            config: self.config,
            store: self.store,
            registry: Arc::new(registry),
        })
    }
}

impl Engine {
    pub fn builder(config: Arc<EngineConfig>, store: Arc<dyn JobStore>) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            launcher: WorkerLauncher::current_exe(None),
            pipelines: Vec::new(),
            standalone: Vec::new(),
        }
    }

    /// The standard engine: Download → Convert → Upload plus the cleaner
    /// and schedule-next housekeeping tasks.
    ///
    /// ```text
    /// ┌─────────────┐          ┌─────────────┐          ┌─────────────┐
    /// │ Download    │          │ Convert     │          │ Upload      │
    /// │             ├─────────►│             ├─────────►│             │
    /// │             │          │             │          │             │
    /// └─────────────┘          └─────────────┘          └─────────────┘
    /// ```
    pub fn standard(
        config: Arc<EngineConfig>,
        store: Arc<dyn JobStore>,
        provider: Arc<dyn FeedProvider>,
        transform: Arc<dyn RecordTransform>,
        sink: Arc<dyn BatchSink>,
        launcher: WorkerLauncher,
    ) -> Result<Engine> {
        let base_path = config.pipeline.base_path.clone();
        Engine::builder(config, store)
            .launcher(launcher)
            .pipeline(vec![
                Arc::new(DownloadStage::new(provider, base_path.clone())),
                Arc::new(ConvertStage::new(transform, base_path.clone())),
                Arc::new(UploadStage::new(sink, base_path)),
            ])
            .standalone(Arc::new(Cleaner))
            .standalone(Arc::new(ScheduleNextDownload))
            .build()
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The registry doubles as the control surface for the resource layer.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run the scheduler loop until `shutdown` fires.
    pub async fn run_scheduler(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let scheduler = Scheduler::new(self.registry.clone(), self.config.scheduler.clone());
        scheduler.run(shutdown).await
    }

    /// Worker-process entry point: resolve the task by slug and run it.
    /// The heartbeat cell comes from the environment the parent set; the
    /// store handle in `self` must have been freshly connected in this
    /// process.
    pub async fn run_worker(&self, slug: &str, invocation: WorkerInvocation) -> Result<()> {
        let (settings, work) = self.registry.work_of(slug).await.ok_or_else(|| {
            EngineError::Configuration(format!("unknown worker task: {slug}"))
        })?;

        let heartbeat = match HeartbeatCell::from_env() {
            Some(cell) => cell,
            None => HeartbeatCell::create(&self.config.pipeline.heartbeat_dir(), slug)?,
        };
        let cx = WorkerContext {
            store: self.store.clone(),
            config: self.config.clone(),
            heartbeat,
        };

        match work {
            TaskWork::Standalone(work) => {
                run_standalone_task(work.as_ref(), &settings, &cx).await;
                Ok(())
            }
            TaskWork::Pipe(work) => {
                let request_id = invocation.request_id.ok_or_else(|| {
                    EngineError::Configuration(format!("{slug}: worker started without request id"))
                })?;
                let priority = invocation.priority.unwrap_or(Priority::High);
                let outcome = run_pipe_task(
                    work.as_ref(),
                    &settings,
                    &cx,
                    &request_id,
                    invocation.request_dir,
                    priority,
                )
                .await?;
                match outcome {
                    StageOutcome::Completed => {
                        info!(task = %slug, request_id = %request_id, "stage completed");
                    }
                    StageOutcome::Failed => {
                        error!(task = %slug, request_id = %request_id, "stage failed");
                    }
                }
                Ok(())
            }
        }
    }
}
