//! # Task Registry
//!
//! Owns every task handle, wires pipeline adjacency at registration time,
//! and exposes the watchdog sweep plus the control surface the resource
//! layer calls (snapshot, pause/resume, trigger, kill).
//!
//! Terminal status labels are computed while pipelines register and
//! returned by [`TaskRegistry::terminal_statuses`]; nothing reads them
//! from shared mutable state.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::task::{
    PipeTask, PreflightContext, StandaloneTask, TaskHandle, TaskSnapshot, TaskWork, WorkerLauncher,
};
use crate::config::{ensure_dir, EngineConfig};
use crate::error::Result;
use crate::store::JobStore;

/// Registry of all scheduled tasks.
pub struct TaskRegistry {
    tasks: Vec<Arc<Mutex<TaskHandle>>>,
    terminal_statuses: Vec<String>,
    store: Arc<dyn JobStore>,
    config: Arc<EngineConfig>,
    launcher: WorkerLauncher,
    /// Serializes pipeline worker spawning relative to store-connection
    /// setup. Never held across worker execution.
    spawn_lock: Arc<parking_lot::Mutex<()>>,
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: Arc<EngineConfig>,
        launcher: WorkerLauncher,
    ) -> Self {
        Self {
            tasks: Vec::new(),
            terminal_statuses: Vec::new(),
            store,
            config,
            launcher,
            spawn_lock: Arc::new(parking_lot::Mutex::new(())),
        }
    }

    fn handle(&self, work: TaskWork) -> TaskHandle {
        TaskHandle::new(
            work,
            self.launcher.clone(),
            self.config.pipeline.heartbeat_dir(),
            self.spawn_lock.clone(),
        )
    }

    /// Register a standalone task.
    pub fn add_standalone(&mut self, work: Arc<dyn StandaloneTask>) {
        let handle = self.handle(TaskWork::Standalone(work));
        debug!(task = %handle.settings().name, "standalone task registered");
        self.tasks.push(Arc::new(Mutex::new(handle)));
    }

    /// Register an ordered pipeline. List order defines adjacency: each
    /// stage's output queue is the next stage's input queue; the last
    /// stage completes into the done directory and contributes its
    /// complete label to the terminal status set.
    pub fn add_pipeline(&mut self, stages: Vec<Arc<dyn PipeTask>>) -> Result<()> {
        let mut handles: Vec<TaskHandle> = stages
            .into_iter()
            .map(|work| self.handle(TaskWork::Pipe(work)))
            .collect();

        let count = handles.len();
        let names: Vec<String> = handles.iter().map(|h| h.settings().name.clone()).collect();
        let input_dirs: Vec<Option<std::path::PathBuf>> =
            handles.iter().map(|h| h.settings().input_dir()).collect();

        for (index, handle) in handles.iter_mut().enumerate() {
            let settings = handle.settings_mut();
            let is_first = index == 0;
            let is_last = index + 1 == count;
            let status_complete = settings.status_complete();

            {
                let pipe = settings.pipe_mut().ok_or_else(|| {
                    crate::error::EngineError::Configuration(format!(
                        "{} registered as a pipeline stage but is not a pipe task",
                        names[index]
                    ))
                })?;
                pipe.pipe_index = Some(index);
                pipe.is_pipe_first = is_first;
                pipe.is_pipe_last = is_last;
                if !is_first {
                    pipe.previous_task_name = Some(names[index - 1].clone());
                }
                pipe.output_dir = if is_last {
                    Some(self.config.pipeline.done_dir())
                } else {
                    input_dirs[index + 1].clone()
                };
            }

            if is_last {
                self.terminal_statuses.push(status_complete);
            }

            if let Some(input_dir) = settings.input_dir() {
                ensure_dir(&input_dir)?;
            }
            debug!(
                task = %settings.name,
                index,
                is_first,
                is_last,
                output_dir = ?settings.pipe().and_then(|p| p.output_dir.clone()),
                "pipeline stage registered"
            );
        }

        ensure_dir(&self.config.pipeline.done_dir())?;
        ensure_dir(&self.config.pipeline.failed_dir())?;

        self.tasks
            .extend(handles.into_iter().map(|h| Arc::new(Mutex::new(h))));
        Ok(())
    }

    /// Terminal status labels of all registered pipelines.
    pub fn terminal_statuses(&self) -> &[String] {
        &self.terminal_statuses
    }

    /// Preflight context handed to every task.
    pub fn context(&self) -> PreflightContext {
        PreflightContext {
            store: self.store.clone(),
            config: self.config.clone(),
            terminal_statuses: Arc::new(self.terminal_statuses.clone()),
        }
    }

    /// One scheduler tick: run every task whose cadence is due. Task-local
    /// errors never propagate out of the tick.
    pub async fn tick(&self) {
        let now = Instant::now();
        let cx = self.context();
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if handle.due(now) {
                if let Err(e) = handle.run_if_able(&cx).await {
                    error!(task = %handle.settings().name, error = %e, "run_if_able failed");
                }
            }
        }
    }

    /// Watchdog sweep: force-kill every live worker whose heartbeat age
    /// exceeds its execution budget.
    pub async fn watchdog(&self) {
        debug!(task_count = self.tasks.len(), "watchdog sweep");
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if handle.heartbeat_expired() {
                let last_heartbeat = handle.last_heartbeat();
                warn!(
                    task = %handle.settings().name,
                    last_heartbeat = ?last_heartbeat,
                    "heartbeat expired, killing worker"
                );
                if let Err(e) = handle.kill().await {
                    error!(task = %handle.settings().name, error = %e, "watchdog kill failed");
                }
            } else {
                handle.reap_if_exited().await;
            }
        }
    }

    /// Names of tasks whose worker is currently alive.
    pub async fn alive(&self) -> Vec<String> {
        let mut alive = Vec::new();
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if handle.is_alive() {
                alive.push(handle.settings().name.clone());
            }
        }
        alive
    }

    pub async fn alive_count(&self) -> usize {
        self.alive().await.len()
    }

    /// Kill every live worker, concurrently.
    pub async fn kill_all(&self) {
        let kills = self.tasks.iter().map(|task| async move {
            let mut handle = task.lock().await;
            if let Err(e) = handle.kill().await {
                error!(task = %handle.settings().name, error = %e, "kill failed");
            }
        });
        futures::future::join_all(kills).await;
    }

    fn matches(handle: &TaskHandle, name: &str) -> bool {
        handle.settings().name.eq_ignore_ascii_case(name)
            || handle.settings().slug().eq_ignore_ascii_case(name)
    }

    /// Kill a named task's live worker. Returns false for unknown names.
    pub async fn kill(&self, name: &str) -> Result<bool> {
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if Self::matches(&handle, name) {
                handle.kill().await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pause or resume a named task. Returns false for unknown names.
    pub async fn set_paused(&self, name: &str, paused: bool) -> bool {
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if Self::matches(&handle, name) {
                handle.settings_mut().paused = paused;
                return true;
            }
        }
        false
    }

    /// Trigger an immediate out-of-schedule run. A no-op while the task's
    /// worker is alive, like any other `run_if_able`.
    pub async fn trigger(&self, name: &str) -> Result<bool> {
        let cx = self.context();
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if Self::matches(&handle, name) {
                handle.run_if_able(&cx).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Snapshot of every task for the resource layer, pipes first in
    /// pipeline order, then standalone tasks by name.
    pub async fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut snapshots = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut handle = task.lock().await;
            snapshots.push(handle.snapshot());
        }
        snapshots.sort_by(|a, b| {
            (&a.task_type, a.pipe_index, &a.name).cmp(&(&b.task_type, b.pipe_index, &b.name))
        });
        snapshots
    }

    /// Snapshot of a single named task.
    pub async fn snapshot_of(&self, name: &str) -> Option<TaskSnapshot> {
        for task in &self.tasks {
            let mut handle = task.lock().await;
            if Self::matches(&handle, name) {
                return Some(handle.snapshot());
            }
        }
        None
    }

    /// The settings and work of a named task, for worker-side dispatch.
    pub async fn work_of(&self, slug: &str) -> Option<(super::settings::TaskSettings, TaskWork)> {
        for task in &self.tasks {
            let handle = task.lock().await;
            if Self::matches(&handle, slug) {
                return Some((handle.settings().clone(), handle.work.clone()));
            }
        }
        None
    }
}
