//! # Postgres Job Store
//!
//! [`JobStore`] implementation over sqlx. Uses the runtime query API with
//! bind parameters; the schema is owned here and created on first use so
//! deployments need no external migration tooling. Stage timestamps live
//! in a JSONB column keyed `<stage>_start` / `<stage>_complete`, so adding
//! a pipeline stage never changes the schema.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

use super::job_request::{
    CountField, DateStamp, JobCounts, JobRequest, JobType, NewJobRequest, StageTimes,
};
use super::{JobStore, StoreError};
use crate::config::DatabaseConfig;
use crate::constants::title_case;

const CREATE_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS job_request (
    request_id               TEXT PRIMARY KEY,
    job_type                 TEXT NOT NULL,
    status                   TEXT NOT NULL DEFAULT 'Pending',
    date_queued              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    date_started             TIMESTAMPTZ,
    date_completed           TIMESTAMPTZ,
    date_failed              TIMESTAMPTZ,
    window_start             TIMESTAMPTZ NOT NULL,
    window_end               TIMESTAMPTZ NOT NULL,
    stage_times              JSONB NOT NULL DEFAULT '{}'::jsonb,
    count_download_indicator BIGINT NOT NULL DEFAULT 0,
    count_convert_indicator  BIGINT NOT NULL DEFAULT 0,
    count_upload_success     BIGINT NOT NULL DEFAULT 0,
    count_upload_error       BIGINT NOT NULL DEFAULT 0
)";

const SELECT_COLUMNS: &str = "request_id, job_type, status, date_queued, date_started, \
     date_completed, date_failed, window_start, window_end, stage_times, \
     count_download_indicator, count_convert_indicator, count_upload_success, \
     count_upload_error";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct JobRequestRow {
    request_id: String,
    job_type: String,
    status: String,
    date_queued: DateTime<Utc>,
    date_started: Option<DateTime<Utc>>,
    date_completed: Option<DateTime<Utc>>,
    date_failed: Option<DateTime<Utc>>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    stage_times: serde_json::Value,
    count_download_indicator: i64,
    count_convert_indicator: i64,
    count_upload_success: i64,
    count_upload_error: i64,
}

impl TryFrom<JobRequestRow> for JobRequest {
    type Error = StoreError;

    fn try_from(row: JobRequestRow) -> Result<Self, Self::Error> {
        let stage_times: StageTimes = if row.stage_times.is_null() {
            StageTimes::default()
        } else {
            serde_json::from_value(row.stage_times)?
        };
        Ok(JobRequest {
            request_id: row.request_id,
            job_type: JobType::parse(&row.job_type),
            status: row.status,
            date_queued: row.date_queued,
            date_started: row.date_started,
            date_completed: row.date_completed,
            date_failed: row.date_failed,
            window_start: row.window_start,
            window_end: row.window_end,
            stage_times,
            counts: JobCounts {
                download_indicator: row.count_download_indicator,
                convert_indicator: row.count_convert_indicator,
                upload_success: row.count_upload_success,
                upload_error: row.count_upload_error,
            },
        })
    }
}

impl PgJobStore {
    /// Connect a new pool. Called once per process: the scheduler at boot
    /// and every worker after spawn. Pools are never inherited.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by embedding applications).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the job_request table if it does not exist.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        debug!("job_request table ready");
        Ok(())
    }

    fn lowered(statuses: &[String]) -> Vec<String> {
        statuses.iter().map(|s| s.to_lowercase()).collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, new: NewJobRequest) -> Result<JobRequest, StoreError> {
        let sql = format!(
            "INSERT INTO job_request (request_id, job_type, status, window_start, window_end) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {SELECT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRequestRow>(&sql)
            .bind(&new.request_id)
            .bind(new.job_type.as_str())
            .bind(title_case(crate::constants::STATUS_PENDING))
            .bind(new.window_start)
            .bind(new.window_end)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation())
                {
                    StoreError::Duplicate {
                        request_id: new.request_id.clone(),
                    }
                } else {
                    StoreError::Database(e)
                }
            })?;
        row.try_into()
    }

    async fn get(&self, request_id: &str) -> Result<Option<JobRequest>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM job_request WHERE request_id = $1");
        let row = sqlx::query_as::<_, JobRequestRow>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRequest::try_from).transpose()
    }

    async fn set_status(
        &self,
        request_id: &str,
        status: &str,
        stamps: &[DateStamp],
    ) -> Result<(), StoreError> {
        // one `now` for every stamped field, for consistency
        let now = Utc::now();

        let mut clauses = vec!["status = $2".to_string()];
        let mut uses_now = false;
        let mut patch: std::collections::BTreeMap<String, DateTime<Utc>> = Default::default();

        for stamp in stamps {
            match stamp {
                DateStamp::Started => {
                    clauses.push("date_started = $3".to_string());
                    uses_now = true;
                }
                DateStamp::Completed => {
                    clauses.push("date_completed = $3".to_string());
                    uses_now = true;
                }
                DateStamp::Failed => {
                    clauses.push("date_failed = $3".to_string());
                    uses_now = true;
                }
                DateStamp::StageStart(stage) => {
                    patch.insert(StageTimes::start_key(stage), now);
                }
                DateStamp::StageComplete(stage) => {
                    patch.insert(StageTimes::complete_key(stage), now);
                }
            }
        }

        let patch_index = if uses_now { 4 } else { 3 };
        if !patch.is_empty() {
            clauses.push(format!("stage_times = stage_times || ${patch_index}"));
        }

        let sql = format!(
            "UPDATE job_request SET {} WHERE request_id = $1",
            clauses.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(request_id)
            .bind(title_case(status));
        if uses_now {
            query = query.bind(now);
        }
        if !patch.is_empty() {
            query = query.bind(serde_json::to_value(&patch)?);
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(request_id));
        }
        Ok(())
    }

    async fn increment_counts(
        &self,
        request_id: &str,
        deltas: &[(CountField, i64)],
    ) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut clauses = Vec::with_capacity(deltas.len());
        for (i, (field, _)) in deltas.iter().enumerate() {
            let column = field.column();
            clauses.push(format!("{column} = {column} + ${}", i + 2));
        }
        let sql = format!(
            "UPDATE job_request SET {} WHERE request_id = $1",
            clauses.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(request_id);
        for (_, delta) in deltas {
            query = query.bind(*delta);
        }
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(request_id));
        }
        Ok(())
    }

    async fn reset_counts(
        &self,
        request_id: &str,
        fields: &[CountField],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let clauses: Vec<String> = fields
            .iter()
            .map(|f| format!("{} = 0", f.column()))
            .collect();
        let sql = format!(
            "UPDATE job_request SET {} WHERE request_id = $1",
            clauses.join(", ")
        );
        let result = sqlx::query(&sql).bind(request_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(request_id));
        }
        Ok(())
    }

    async fn count_not_in_status(&self, statuses: &[String]) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM job_request WHERE LOWER(status) <> ALL($1)",
        )
        .bind(Self::lowered(statuses))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn next_launchable(&self, statuses: &[String]) -> Result<Option<JobRequest>, StoreError> {
        // job_type DESC puts 'scheduled' before 'ad-hoc'
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM job_request WHERE LOWER(status) = ANY($1) \
             ORDER BY job_type DESC, date_queued ASC LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRequestRow>(&sql)
            .bind(Self::lowered(statuses))
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRequest::try_from).transpose()
    }

    async fn latest_scheduled(&self) -> Result<Option<JobRequest>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM job_request WHERE job_type = 'scheduled' \
             ORDER BY date_queued DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRequestRow>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRequest::try_from).transpose()
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM job_request \
             WHERE COALESCE(date_completed, date_failed) < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
