//! # Job State Store
//!
//! Durable record of one row per job request. The orchestrator reads and
//! writes through the narrow [`JobStore`] trait; schema and SQL dialect
//! details stay behind it. Two implementations ship here: a Postgres store
//! used in production, and an in-memory store used by tests and embedded
//! scenarios.
//!
//! Status strings are title-cased on write and compared case-insensitively
//! by every query — both implementations enforce this, callers never
//! normalize.

pub mod job_request;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use job_request::{
    CountField, DateStamp, JobCounts, JobRequest, JobType, NewJobRequest, StageTimes,
};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Store operation errors. Treated as transient by the scheduler: the
/// current operation aborts and the request is retried on a later tick.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job request not found: {request_id}")]
    NotFound { request_id: String },

    #[error("duplicate job request: {request_id}")]
    Duplicate { request_id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(request_id: impl Into<String>) -> Self {
        Self::NotFound {
            request_id: request_id.into(),
        }
    }
}

/// Narrow interface between the orchestrator and the durable job store.
///
/// Every worker process obtains its own implementation instance after
/// spawn; connections are never shared across the process boundary.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job request row.
    async fn insert(&self, new: NewJobRequest) -> Result<JobRequest, StoreError>;

    /// Fetch a job request by id.
    async fn get(&self, request_id: &str) -> Result<Option<JobRequest>, StoreError>;

    /// Update status (title-cased on write) and stamp the given date
    /// fields, all with a single consistent `now`.
    async fn set_status(
        &self,
        request_id: &str,
        status: &str,
        stamps: &[DateStamp],
    ) -> Result<(), StoreError>;

    /// Add deltas to the given counters.
    async fn increment_counts(
        &self,
        request_id: &str,
        deltas: &[(CountField, i64)],
    ) -> Result<(), StoreError>;

    /// Zero the given counters.
    async fn reset_counts(&self, request_id: &str, fields: &[CountField])
        -> Result<(), StoreError>;

    /// Count job requests whose status is NOT in `statuses`
    /// (case-insensitive). Used by the download throttle.
    async fn count_not_in_status(&self, statuses: &[String]) -> Result<i64, StoreError>;

    /// The next request whose status is in `statuses`, preferring
    /// `scheduled` over `ad-hoc` job type and then oldest `date_queued`.
    async fn next_launchable(&self, statuses: &[String]) -> Result<Option<JobRequest>, StoreError>;

    /// The most recently queued `scheduled` request, if any.
    async fn latest_scheduled(&self) -> Result<Option<JobRequest>, StoreError>;

    /// Delete rows whose completion or failure date is older than `cutoff`.
    /// Returns the number of rows removed.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
