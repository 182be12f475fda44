//! # Engine Configuration System
//!
//! Typed configuration for the pipeline engine. All tunables come from a
//! TOML file plus `PIPELINE_`-prefixed environment overrides; nothing is
//! read ad hoc from the environment at runtime. Defaults match the
//! production deployment the engine was extracted from.

pub mod loader;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use loader::ConfigManager;

use crate::constants::{DONE_WORKING_DIR, FAILED_WORKING_DIR, PAUSE_FILE};
use crate::error::{EngineError, Result};

/// Root configuration structure mirroring `pipeline.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Database connection settings for the job state store.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Filesystem layout and queue behavior.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Scheduler tick, watchdog, and shutdown settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Schedule-next-download behavior.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Cleaner task behavior.
    #[serde(default)]
    pub cleaner: CleanerConfig,

    /// Default collaborator wiring for the binary.
    #[serde(default)]
    pub feed: FeedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            schedule: ScheduleConfig::default(),
            cleaner: CleanerConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate cross-field invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.separator.chars().count() != 1 {
            return Err(EngineError::Configuration(format!(
                "pipeline.separator must be a single character, got {:?}",
                self.pipeline.separator
            )));
        }
        if self.pipeline.throttle_limit == 0 {
            return Err(EngineError::Configuration(
                "pipeline.throttle_limit must be at least 1".to_string(),
            ));
        }
        if self.schedule.time_chunk_size_hours == 0
            || self.schedule.time_chunk_size_hours_backfill == 0
        {
            return Err(EngineError::Configuration(
                "schedule chunk sizes must be at least 1 hour".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL for the job state store.
    pub url: String,
    /// Connection pool size for the scheduler process. Workers open their
    /// own small pools after spawn; pools are never shared across the
    /// process boundary.
    pub pool: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/pipeline_core".to_string(),
            pool: 5,
            connect_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Base path under which all working directories live.
    pub base_path: PathBuf,
    /// Single-character separator used in request directory names.
    pub separator: String,
    /// Maximum open (non-terminal) job requests before the download stage
    /// stops launching new work.
    pub throttle_limit: i64,
    /// Global pause marker file. Any task sees this and stops launching.
    pub pause_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("pipeline_data"),
            separator: "#".to_string(),
            throttle_limit: 3,
            pause_file: PathBuf::from(PAUSE_FILE),
        }
    }
}

impl PipelineConfig {
    /// Terminal success directory for completed request directories.
    pub fn done_dir(&self) -> PathBuf {
        self.base_path.join(DONE_WORKING_DIR)
    }

    /// Quarantine directory for failed request directories.
    pub fn failed_dir(&self) -> PathBuf {
        self.base_path.join(FAILED_WORKING_DIR)
    }

    /// Directory holding per-task heartbeat files.
    pub fn heartbeat_dir(&self) -> PathBuf {
        self.base_path.join("heartbeats")
    }

    /// Directory holding engine and worker log files.
    pub fn log_dir(&self) -> PathBuf {
        self.base_path.join("log")
    }

    /// The separator as a char. Guaranteed single-char by `validate`.
    pub fn separator_char(&self) -> char {
        self.separator.chars().next().unwrap_or('#')
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Base tick resolution of the scheduler loop.
    pub tick_seconds: u64,
    /// Interval between watchdog sweeps.
    pub watchdog_interval_seconds: u64,
    /// How long shutdown waits for live workers before force-killing.
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            watchdog_interval_seconds: 60,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Days of history to cover when the store has no scheduled requests.
    pub initial_backfill_days: i64,
    /// Window size for steady-state scheduled requests.
    pub time_chunk_size_hours: i64,
    /// Window size for backfill chunks when catching up.
    pub time_chunk_size_hours_backfill: i64,
    /// Minimum gap before a new request is enqueued.
    pub min_gap_hours: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            initial_backfill_days: 30,
            time_chunk_size_hours: 1,
            time_chunk_size_hours_backfill: 24,
            min_gap_hours: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanerConfig {
    /// Disk usage percentage above which request directories are reaped.
    pub max_disk_percent_usage: f64,
    /// Seconds after completion/failure before a job request row is deleted.
    pub max_ttl_job_request_seconds: i64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_disk_percent_usage: 60.0,
            // 30 days
            max_ttl_job_request_seconds: 60 * 60 * 24 * 30,
        }
    }
}

/// Wiring for the default filesystem-backed collaborators used by the
/// binary. Real deployments implement the `feed` traits instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// Directory the default provider reads gzip-JSON feed drops from.
    pub drop_dir: PathBuf,
    /// Directory the default sink writes submitted batches to.
    pub outbox_dir: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            drop_dir: PathBuf::from("pipeline_data").join("feed_drop"),
            outbox_dir: PathBuf::from("pipeline_data").join("outbox"),
        }
    }
}

/// Ensure a directory exists, mapping the error with context.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| EngineError::io(format!("creating {}", path.display()), e))
}
