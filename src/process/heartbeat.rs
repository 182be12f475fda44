//! # Heartbeat Cell
//!
//! Cross-process mutable timestamp. The worker process rewrites the file at
//! every meaningful progress point; the parent reads it during watchdog
//! sweeps. A worker that stops beating for longer than its execution budget
//! is indistinguishable from a stuck one and will be killed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};

/// Environment variable carrying the heartbeat file path into the worker.
pub const HEARTBEAT_ENV_VAR: &str = "PIPELINE_HEARTBEAT_FILE";

/// File-backed heartbeat shared between a worker process and its parent.
#[derive(Debug, Clone)]
pub struct HeartbeatCell {
    path: PathBuf,
}

impl HeartbeatCell {
    /// Parent side: create the cell for a task, seeding it to now.
    pub fn create(dir: &Path, slug: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| EngineError::io(format!("creating {}", dir.display()), e))?;
        let cell = Self {
            path: dir.join(slug),
        };
        cell.beat()?;
        Ok(cell)
    }

    /// Worker side: attach to the cell the parent created.
    pub fn attach(path: PathBuf) -> Self {
        Self { path }
    }

    /// Worker side: attach via the `PIPELINE_HEARTBEAT_FILE` variable.
    pub fn from_env() -> Option<Self> {
        std::env::var(HEARTBEAT_ENV_VAR)
            .ok()
            .map(|p| Self::attach(PathBuf::from(p)))
    }

    /// Record a heartbeat now.
    pub fn beat(&self) -> Result<()> {
        self.beat_at(Utc::now())
    }

    /// Record a heartbeat at a specific instant.
    pub fn beat_at(&self, at: DateTime<Utc>) -> Result<()> {
        fs::write(&self.path, at.to_rfc3339())
            .map_err(|e| EngineError::io(format!("writing {}", self.path.display()), e))
    }

    /// Latest recorded heartbeat. `None` if the file is missing or garbled
    /// (treated by callers as maximally stale).
    pub fn last(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
