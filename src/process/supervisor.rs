//! # Worker Process Supervisor
//!
//! Wraps process creation for task workers: daemon semantics (a worker
//! must not outlive its parent), the shared heartbeat cell, and the
//! liveness/metadata snapshot consumed by the watchdog and the control
//! surface. `expires_percent >= 100` is the watchdog's kill signal.

use std::process::{ExitStatus, Stdio};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{trace, warn};

use super::heartbeat::HeartbeatCell;
use crate::error::{EngineError, Result};

/// Snapshot of a live (or just-exited) worker process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetadata {
    pub pid: Option<u32>,
    pub name: String,
    pub is_alive: bool,
    pub is_daemon: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub max_execution_minutes: i64,
    /// Percent of the execution budget consumed since the last heartbeat.
    pub expires_percent: i64,
}

/// A spawned worker process with attached heartbeat state.
pub struct WorkerProcess {
    child: Child,
    name: String,
    pid: Option<u32>,
    daemon: bool,
    heartbeat: HeartbeatCell,
    max_execution_minutes: i64,
    /// Highest heartbeat observed; keeps the reported value monotonically
    /// non-decreasing even if the cell file is rewritten out of order.
    last_seen: DateTime<Utc>,
    exit: Option<ExitStatus>,
}

impl WorkerProcess {
    /// Spawn a worker. The heartbeat cell is seeded to now so a slow-to-boot
    /// worker is not immediately stale, and `kill_on_drop` guarantees the
    /// child never outlives the parent.
    pub fn spawn(
        name: impl Into<String>,
        mut command: Command,
        heartbeat: HeartbeatCell,
        max_execution_minutes: i64,
    ) -> Result<Self> {
        let name = name.into();
        heartbeat.beat()?;

        command.kill_on_drop(true).stdin(Stdio::null());
        let child = command
            .spawn()
            .map_err(|e| EngineError::process(name.clone(), format!("spawn failed: {e}")))?;
        let pid = child.id();

        trace!(task = %name, pid, "worker spawned");

        Ok(Self {
            child,
            name,
            pid,
            daemon: true,
            heartbeat,
            max_execution_minutes,
            last_seen: Utc::now(),
            exit: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the process has not been reaped. Non-blocking.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Err(e) => {
                warn!(task = %self.name, error = %e, "try_wait failed; treating worker as dead");
                false
            }
        }
    }

    /// Reap an exited worker. No-op if already reaped.
    pub async fn join(&mut self) {
        if self.exit.is_none() {
            match self.child.wait().await {
                Ok(status) => self.exit = Some(status),
                Err(e) => warn!(task = %self.name, error = %e, "join failed"),
            }
        }
    }

    /// Force-kill the worker (SIGKILL) and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .map_err(|e| EngineError::process(self.name.clone(), format!("kill failed: {e}")))?;
        self.join().await;
        Ok(())
    }

    /// Exit status, if the worker has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Latest heartbeat, monotonically non-decreasing while the worker is
    /// alive. A missing or garbled cell reports the last value seen.
    pub fn last_heartbeat(&mut self) -> DateTime<Utc> {
        if let Some(read) = self.heartbeat.last() {
            if read > self.last_seen {
                self.last_seen = read;
            }
        }
        self.last_seen
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&mut self) -> Duration {
        Utc::now() - self.last_heartbeat()
    }

    /// True once the heartbeat age exceeds the execution budget.
    pub fn is_expired(&mut self) -> bool {
        self.heartbeat_age() > Duration::minutes(self.max_execution_minutes)
    }

    /// Metadata snapshot with derived `expires_percent`.
    pub fn metadata(&mut self) -> ProcessMetadata {
        let last_heartbeat = self.last_heartbeat();
        let age = Utc::now() - last_heartbeat;
        let budget = Duration::minutes(self.max_execution_minutes);
        let expires_percent = if budget.num_milliseconds() > 0 {
            age.num_milliseconds() * 100 / budget.num_milliseconds()
        } else {
            100
        };

        ProcessMetadata {
            pid: self.pid,
            name: self.name.clone(),
            is_alive: self.is_alive(),
            is_daemon: self.daemon,
            last_heartbeat,
            max_execution_minutes: self.max_execution_minutes,
            expires_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_command(seconds: u32) -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg(seconds.to_string());
        cmd
    }

    fn cell(dir: &std::path::Path) -> HeartbeatCell {
        HeartbeatCell::create(dir, "test-worker").unwrap()
    }

    #[tokio::test]
    async fn spawned_worker_is_alive_until_killed() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker =
            WorkerProcess::spawn("test", sleep_command(30), cell(dir.path()), 5).unwrap();

        assert!(worker.is_alive());
        assert!(worker.pid().is_some());

        worker.kill().await.unwrap();
        assert!(!worker.is_alive());
        assert!(worker.exit_status().is_some());
    }

    #[tokio::test]
    async fn exited_worker_reports_dead_after_join() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Command::new("true");
        let mut worker = WorkerProcess::spawn("test", cmd, cell(dir.path()), 5).unwrap();

        worker.join().await;
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker =
            WorkerProcess::spawn("test", sleep_command(30), cell(dir.path()), 5).unwrap();
        worker.kill().await.unwrap();
        worker.kill().await.unwrap();
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn fresh_worker_is_not_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker =
            WorkerProcess::spawn("test", sleep_command(30), cell(dir.path()), 5).unwrap();
        assert!(!worker.is_expired());
        let meta = worker.metadata();
        assert!(meta.expires_percent < 100);
        assert!(meta.is_daemon);
        worker.kill().await.unwrap();
    }

    #[tokio::test]
    async fn stale_heartbeat_expires_worker() {
        let dir = tempfile::tempdir().unwrap();
        let heartbeat = cell(dir.path());
        let mut worker =
            WorkerProcess::spawn("test", sleep_command(30), heartbeat.clone(), 5).unwrap();

        heartbeat
            .beat_at(Utc::now() - chrono::Duration::minutes(6))
            .unwrap();
        // the monotonic guard keeps the spawn-time heartbeat, so rewind the
        // baseline the way a genuinely silent worker would look
        worker.last_seen = Utc::now() - chrono::Duration::minutes(6);

        assert!(worker.is_expired());
        assert!(worker.metadata().expires_percent >= 100);
        worker.kill().await.unwrap();
    }
}
