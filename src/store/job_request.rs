//! # Job Request Model
//!
//! One row per unit of pipeline work. A request carries its scheduling
//! window, lifecycle timestamps, per-stage start/complete stamps, and the
//! item counters the stages report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a request entered the system. Scheduled requests are created by the
/// periodic schedule-next task and take precedence over ad-hoc requests
/// triggered by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Scheduled,
    AdHoc,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Scheduled => "scheduled",
            JobType::AdHoc => "ad-hoc",
        }
    }

    pub fn parse(value: &str) -> JobType {
        if value.eq_ignore_ascii_case("scheduled") {
            JobType::Scheduled
        } else {
            JobType::AdHoc
        }
    }
}

/// Per-stage start/complete timestamps, keyed `<stage>_start` /
/// `<stage>_complete`. Stored as a JSONB column in Postgres so new stages
/// never require schema changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimes(pub BTreeMap<String, DateTime<Utc>>);

impl StageTimes {
    pub fn start_key(stage: &str) -> String {
        format!("{stage}_start")
    }

    pub fn complete_key(stage: &str) -> String {
        format!("{stage}_complete")
    }

    pub fn start_of(&self, stage: &str) -> Option<DateTime<Utc>> {
        self.0.get(&Self::start_key(stage)).copied()
    }

    pub fn complete_of(&self, stage: &str) -> Option<DateTime<Utc>> {
        self.0.get(&Self::complete_key(stage)).copied()
    }

    pub fn insert(&mut self, key: String, at: DateTime<Utc>) {
        self.0.insert(key, at);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Item counters reported by the stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub download_indicator: i64,
    pub convert_indicator: i64,
    pub upload_success: i64,
    pub upload_error: i64,
}

/// Counter columns addressable through the store interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountField {
    DownloadIndicator,
    ConvertIndicator,
    UploadSuccess,
    UploadError,
}

impl CountField {
    /// Store column name for this counter.
    pub fn column(self) -> &'static str {
        match self {
            CountField::DownloadIndicator => "count_download_indicator",
            CountField::ConvertIndicator => "count_convert_indicator",
            CountField::UploadSuccess => "count_upload_success",
            CountField::UploadError => "count_upload_error",
        }
    }
}

/// Date fields stamped together with a status change. Stage stamps carry
/// the stage's snake-case name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateStamp {
    Started,
    Completed,
    Failed,
    StageStart(String),
    StageComplete(String),
}

/// A job request row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub request_id: String,
    pub job_type: JobType,
    /// Free-form status string, title-cased in the store.
    pub status: String,
    pub date_queued: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_completed: Option<DateTime<Utc>>,
    pub date_failed: Option<DateTime<Utc>>,
    /// Provider time window this request covers.
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub stage_times: StageTimes,
    pub counts: JobCounts,
}

/// Fields required to create a job request. Status defaults to `pending`
/// and `date_queued` to now.
#[derive(Debug, Clone)]
pub struct NewJobRequest {
    pub request_id: String,
    pub job_type: JobType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl NewJobRequest {
    /// New request with a generated v4 request id.
    pub fn generate(
        job_type: JobType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            job_type,
            window_start,
            window_end,
        }
    }
}
