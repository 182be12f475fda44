//! # Task Base Abstraction
//!
//! A task is a unit of schedulable work with a three-phase lifecycle:
//! preflight-check → launch → run. The scheduler drives the parent-side
//! [`TaskHandle`]; the `run` phase executes only inside a spawned worker
//! process.
//!
//! Flow:
//!
//! 1. the registry wires tasks at construction (pipe adjacency, cadence)
//! 2. scheduler tick calls `run_if_able()`
//!    a. no-op if a worker for this task is already alive
//!    b. refresh the three pause flags from their sources
//!    c. run the task's preflight check if not paused
//! 3. preflight returns launch arguments when eligible work exists
//! 4. `launch()` spawns a worker process with heartbeat seeded to now
//! 5. the worker process re-creates its resources and calls `run()`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::request_dir;
use super::settings::{ScheduleUnit, TaskKind, TaskSettings};
use crate::config::EngineConfig;
use crate::constants::Priority;
use crate::error::{EngineError, Result};
use crate::process::{HeartbeatCell, ProcessMetadata, WorkerProcess, HEARTBEAT_ENV_VAR};
use crate::store::JobStore;

/// Context available to preflight checks, built by the registry.
pub struct PreflightContext {
    pub store: Arc<dyn JobStore>,
    pub config: Arc<EngineConfig>,
    /// Terminal status labels of all registered pipelines, computed at
    /// registration time.
    pub terminal_statuses: Arc<Vec<String>>,
}

/// Context available to `run`, built inside the worker process. The store
/// handle is always freshly connected after spawn — resources acquired
/// before the process boundary are never valid behind it.
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub config: Arc<EngineConfig>,
    pub heartbeat: HeartbeatCell,
}

impl WorkerContext {
    /// Record progress. Must be called at least once per
    /// `max_execution_minutes` or the watchdog kills the worker.
    pub fn update_heartbeat(&self) {
        if let Err(e) = self.heartbeat.beat() {
            warn!(error = %e, "heartbeat update failed");
        }
    }
}

/// Arguments a preflight check hands to `launch`.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchArgs {
    Standalone,
    Pipe {
        request_id: String,
        /// Present for every stage but the pipe's first, which materializes
        /// the directory itself inside the worker.
        request_dir: Option<PathBuf>,
        priority: Priority,
    },
}

/// Outcome of a preflight check.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    Launch(LaunchArgs),
    Skip(String),
}

impl Preflight {
    pub fn skip(reason: impl Into<String>) -> Self {
        Preflight::Skip(reason.into())
    }
}

/// Standalone task: no directory hand-off (cleaner, schedule-next).
#[async_trait]
pub trait StandaloneTask: Send + Sync {
    /// Initial settings. The registry owns the runtime copy.
    fn settings(&self) -> TaskSettings;

    /// Default: always eligible.
    async fn preflight(
        &self,
        _settings: &TaskSettings,
        _cx: &PreflightContext,
    ) -> Result<Preflight> {
        Ok(Preflight::Launch(LaunchArgs::Standalone))
    }

    /// Business logic. Worker process only.
    async fn run(&self, settings: &TaskSettings, cx: &WorkerContext) -> Result<()>;
}

/// Input/output resolved for one pipeline stage invocation.
#[derive(Debug, Clone)]
pub struct StageIo {
    pub request_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Pipeline stage task: consumes request directories from its input queue,
/// produces into the next stage's queue.
#[async_trait]
pub trait PipeTask: Send + Sync {
    /// Initial settings; must be `TaskKind::Pipe`.
    fn settings(&self) -> TaskSettings;

    /// Default: take the next request directory from the input queue.
    async fn preflight(
        &self,
        settings: &TaskSettings,
        cx: &PreflightContext,
    ) -> Result<Preflight> {
        queue_preflight(settings, cx.config.pipeline.separator_char())
    }

    /// Stage business logic. Worker process only; lifecycle transitions
    /// around it are handled by [`pipe::run_pipe_task`].
    async fn run(&self, settings: &TaskSettings, cx: &WorkerContext, io: &StageIo) -> Result<()>;
}

/// Default pipe preflight: first directory in the input queue, priority
/// then FIFO. Skips the tick when the queue is empty.
pub fn queue_preflight(settings: &TaskSettings, separator: char) -> Result<Preflight> {
    let input_dir = settings
        .input_dir()
        .ok_or_else(|| EngineError::Configuration(format!("{} is not a pipe task", settings.name)))?;

    match request_dir::next_request_dir(&input_dir)? {
        Some(dir) => {
            let request_id = request_dir::read_request_id(&dir)?;
            let priority = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| request_dir::RequestDirName::parse(n, separator))
                .map_or(Priority::High, |parsed| parsed.priority);
            Ok(Preflight::Launch(LaunchArgs::Pipe {
                request_id,
                request_dir: Some(dir),
                priority,
            }))
        }
        None => Ok(Preflight::skip("no request dir found")),
    }
}

/// The work a handle supervises: one of the two task variants.
#[derive(Clone)]
pub enum TaskWork {
    Standalone(Arc<dyn StandaloneTask>),
    Pipe(Arc<dyn PipeTask>),
}

impl TaskWork {
    pub fn settings(&self) -> TaskSettings {
        match self {
            TaskWork::Standalone(work) => work.settings(),
            TaskWork::Pipe(work) => work.settings(),
        }
    }

    pub async fn preflight(
        &self,
        settings: &TaskSettings,
        cx: &PreflightContext,
    ) -> Result<Preflight> {
        match self {
            TaskWork::Standalone(work) => work.preflight(settings, cx).await,
            TaskWork::Pipe(work) => work.preflight(settings, cx).await,
        }
    }
}

/// How worker processes are started. Production re-invokes the current
/// executable with the `worker` subcommand; tests substitute a fixed
/// command.
#[derive(Debug, Clone)]
pub enum WorkerLauncher {
    CurrentExe { config_path: Option<PathBuf> },
    Fixed { program: PathBuf, args: Vec<String> },
}

impl WorkerLauncher {
    pub fn current_exe(config_path: Option<PathBuf>) -> Self {
        Self::CurrentExe { config_path }
    }

    pub fn fixed(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self::Fixed {
            program: program.into(),
            args,
        }
    }

    /// Build the worker command for a launch.
    pub fn command(
        &self,
        settings: &TaskSettings,
        args: &LaunchArgs,
        heartbeat_path: &Path,
    ) -> Result<Command> {
        match self {
            WorkerLauncher::CurrentExe { config_path } => {
                let exe = std::env::current_exe().map_err(|e| {
                    EngineError::process(settings.slug(), format!("current_exe failed: {e}"))
                })?;
                let mut command = Command::new(exe);
                command.arg("worker").arg("--task").arg(settings.slug());
                if let LaunchArgs::Pipe {
                    request_id,
                    request_dir,
                    priority,
                } = args
                {
                    command.arg("--request-id").arg(request_id);
                    if let Some(dir) = request_dir {
                        command.arg("--request-dir").arg(dir);
                    }
                    command.arg("--priority").arg(priority.as_str());
                }
                if let Some(path) = config_path {
                    command.env(crate::config::loader::CONFIG_ENV_VAR, path);
                }
                command.env(HEARTBEAT_ENV_VAR, heartbeat_path);
                Ok(command)
            }
            WorkerLauncher::Fixed { program, args: fixed } => {
                let mut command = Command::new(program);
                command.args(fixed);
                command.env(HEARTBEAT_ENV_VAR, heartbeat_path);
                Ok(command)
            }
        }
    }
}

/// Control-surface snapshot of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub slug: String,
    pub description: String,
    pub task_type: String,
    pub pipe_index: Option<usize>,
    pub schedule_period: u64,
    pub schedule_unit: ScheduleUnit,
    pub max_execution_minutes: i64,
    pub paused: bool,
    pub paused_by_file: bool,
    pub paused_by_global_file: bool,
    pub effective_paused: bool,
    pub process: Option<ProcessMetadata>,
}

/// Parent-side state machine for one task: settings, the live worker
/// process (at most one), and scheduling bookkeeping.
pub struct TaskHandle {
    pub(crate) settings: TaskSettings,
    pub(crate) work: TaskWork,
    process: Option<WorkerProcess>,
    launcher: WorkerLauncher,
    heartbeat_dir: PathBuf,
    spawn_lock: Arc<parking_lot::Mutex<()>>,
    next_run: Instant,
}

impl TaskHandle {
    pub fn new(
        work: TaskWork,
        launcher: WorkerLauncher,
        heartbeat_dir: PathBuf,
        spawn_lock: Arc<parking_lot::Mutex<()>>,
    ) -> Self {
        let settings = work.settings();
        let next_run = Instant::now() + settings.schedule_interval();
        Self {
            settings,
            work,
            process: None,
            launcher,
            heartbeat_dir,
            spawn_lock,
            next_run,
        }
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut TaskSettings {
        &mut self.settings
    }

    pub fn slug(&self) -> String {
        self.settings.slug()
    }

    /// True if this handle's cadence is due; advances the next deadline
    /// when it is.
    pub fn due(&mut self, now: Instant) -> bool {
        if now >= self.next_run {
            self.next_run = now + self.settings.schedule_interval();
            true
        } else {
            false
        }
    }

    /// True while this task's worker process is alive.
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(WorkerProcess::is_alive)
    }

    /// True when the live worker's heartbeat age exceeds its budget.
    pub fn heartbeat_expired(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => process.is_alive() && process.is_expired(),
            None => false,
        }
    }

    /// Re-read the three pause sources. Called once per tick; nothing else
    /// touches the pause flags.
    pub fn refresh_pause_state(&mut self, config: &EngineConfig) {
        if !self.settings.paused {
            self.settings.paused_by_global_file = config.pipeline.pause_file.is_file();
        }
        if !self.settings.paused && !self.settings.paused_by_global_file {
            if let Some(pause_file) = self.settings.pause_file() {
                self.settings.paused_by_file = pause_file.is_file();
            }
        }
    }

    /// Validate the task can run, and if so launch it. No-op while a
    /// worker is alive or any pause source is set; preflight errors skip
    /// the tick without mutating state.
    pub async fn run_if_able(&mut self, cx: &PreflightContext) -> Result<()> {
        if let Some(process) = self.process.as_mut() {
            if process.is_alive() {
                trace!(task = %self.settings.slug(), "worker alive, launch prohibited");
                return Ok(());
            }
            process.join().await;
            self.process = None;
        }

        self.refresh_pause_state(&cx.config);
        if self.settings.is_paused() {
            info!(
                task = %self.settings.name,
                paused = self.settings.paused,
                paused_by_file = self.settings.paused_by_file,
                paused_by_global_file = self.settings.paused_by_global_file,
                "task paused"
            );
            return Ok(());
        }

        let preflight = self.work.preflight(&self.settings, cx).await;
        match preflight {
            Ok(Preflight::Launch(args)) => self.launch(&args),
            Ok(Preflight::Skip(reason)) => {
                trace!(task = %self.settings.name, reason = %reason, "preflight skip");
                Ok(())
            }
            Err(e) => {
                // preflight errors skip this tick; retried on the next one
                warn!(task = %self.settings.name, error = %e, "preflight check failed");
                Ok(())
            }
        }
    }

    /// Spawn the worker process. Pipeline spawns serialize on the shared
    /// process-creation lock; the lock never covers worker execution.
    pub fn launch(&mut self, args: &LaunchArgs) -> Result<()> {
        let slug = self.settings.slug();
        let heartbeat = HeartbeatCell::create(&self.heartbeat_dir, &slug)?;
        let command = self.launcher.command(&self.settings, args, heartbeat.path())?;

        let process = {
            let _guard = matches!(self.settings.kind, TaskKind::Pipe(_))
                .then(|| self.spawn_lock.lock());
            WorkerProcess::spawn(
                self.settings.name.clone(),
                command,
                heartbeat,
                self.settings.max_execution_minutes,
            )?
        };

        info!(task = %slug, pid = ?process.pid(), args = ?args, "worker launched");
        self.process = Some(process);
        Ok(())
    }

    /// Force-kill the live worker, if any.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(process) = self.process.as_mut() {
            if process.is_alive() {
                warn!(task = %self.settings.name, pid = ?process.pid(), "killing worker");
            }
            process.kill().await?;
        }
        Ok(())
    }

    /// Reap a finished worker without blocking on a live one.
    pub async fn reap_if_exited(&mut self) {
        if let Some(process) = self.process.as_mut() {
            if !process.is_alive() {
                process.join().await;
                self.process = None;
            }
        }
    }

    /// Control-surface snapshot.
    pub fn snapshot(&mut self) -> TaskSnapshot {
        let process = match self.process.as_mut() {
            Some(process) => {
                if process.is_alive() {
                    Some(process.metadata())
                } else {
                    None
                }
            }
            None => None,
        };
        TaskSnapshot {
            name: self.settings.name.clone(),
            slug: self.settings.slug(),
            description: self.settings.description.clone(),
            task_type: self.settings.task_type().to_string(),
            pipe_index: self.settings.pipe().and_then(|p| p.pipe_index),
            schedule_period: self.settings.schedule_period,
            schedule_unit: self.settings.schedule_unit,
            max_execution_minutes: self.settings.max_execution_minutes,
            paused: self.settings.paused,
            paused_by_file: self.settings.paused_by_file,
            paused_by_global_file: self.settings.paused_by_global_file,
            effective_paused: self.settings.is_paused(),
            process,
        }
    }

    /// Last heartbeat of the live worker, for watchdog logging.
    pub fn last_heartbeat(&mut self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.process.as_mut().map(WorkerProcess::last_heartbeat)
    }
}

/// Worker wrapper for standalone tasks: any error in `run` is caught and
/// logged, leaving the task eligible for the next scheduled attempt.
pub async fn run_standalone_task(
    work: &dyn StandaloneTask,
    settings: &TaskSettings,
    cx: &WorkerContext,
) {
    debug!(task = %settings.slug(), "task start");
    if let Err(e) = work.run(settings, cx).await {
        tracing::error!(task = %settings.name, error = %e, "task failed");
    }
}
