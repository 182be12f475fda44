//! # In-Memory Job Store
//!
//! [`JobStore`] implementation over a `parking_lot` map. Single-process
//! only — it cannot back spawned worker processes — which makes it the
//! store of choice for tests and for exercising pipeline logic in-process.
//! Semantics (title-casing, case-insensitive comparison, ordering) match
//! the Postgres store exactly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::job_request::{
    CountField, DateStamp, JobRequest, JobType, NewJobRequest, StageTimes,
};
use super::{JobStore, StoreError};
use crate::constants::{status_in, title_case, STATUS_PENDING};

/// In-memory job store for tests and embedded use.
#[derive(Default)]
pub struct MemoryJobStore {
    rows: RwLock<HashMap<String, JobRequest>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, unordered. Test helper.
    pub fn all(&self) -> Vec<JobRequest> {
        self.rows.read().values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, new: NewJobRequest) -> Result<JobRequest, StoreError> {
        let mut rows = self.rows.write();
        if rows.contains_key(&new.request_id) {
            return Err(StoreError::Duplicate {
                request_id: new.request_id,
            });
        }
        let row = JobRequest {
            request_id: new.request_id.clone(),
            job_type: new.job_type,
            status: title_case(STATUS_PENDING),
            date_queued: Utc::now(),
            date_started: None,
            date_completed: None,
            date_failed: None,
            window_start: new.window_start,
            window_end: new.window_end,
            stage_times: StageTimes::default(),
            counts: Default::default(),
        };
        rows.insert(new.request_id, row.clone());
        Ok(row)
    }

    async fn get(&self, request_id: &str) -> Result<Option<JobRequest>, StoreError> {
        Ok(self.rows.read().get(request_id).cloned())
    }

    async fn set_status(
        &self,
        request_id: &str,
        status: &str,
        stamps: &[DateStamp],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(request_id)
            .ok_or_else(|| StoreError::not_found(request_id))?;
        row.status = title_case(status);
        for stamp in stamps {
            match stamp {
                DateStamp::Started => row.date_started = Some(now),
                DateStamp::Completed => row.date_completed = Some(now),
                DateStamp::Failed => row.date_failed = Some(now),
                DateStamp::StageStart(stage) => {
                    row.stage_times.insert(StageTimes::start_key(stage), now);
                }
                DateStamp::StageComplete(stage) => {
                    row.stage_times.insert(StageTimes::complete_key(stage), now);
                }
            }
        }
        Ok(())
    }

    async fn increment_counts(
        &self,
        request_id: &str,
        deltas: &[(CountField, i64)],
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(request_id)
            .ok_or_else(|| StoreError::not_found(request_id))?;
        for (field, delta) in deltas {
            match field {
                CountField::DownloadIndicator => row.counts.download_indicator += delta,
                CountField::ConvertIndicator => row.counts.convert_indicator += delta,
                CountField::UploadSuccess => row.counts.upload_success += delta,
                CountField::UploadError => row.counts.upload_error += delta,
            }
        }
        Ok(())
    }

    async fn reset_counts(
        &self,
        request_id: &str,
        fields: &[CountField],
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(request_id)
            .ok_or_else(|| StoreError::not_found(request_id))?;
        for field in fields {
            match field {
                CountField::DownloadIndicator => row.counts.download_indicator = 0,
                CountField::ConvertIndicator => row.counts.convert_indicator = 0,
                CountField::UploadSuccess => row.counts.upload_success = 0,
                CountField::UploadError => row.counts.upload_error = 0,
            }
        }
        Ok(())
    }

    async fn count_not_in_status(&self, statuses: &[String]) -> Result<i64, StoreError> {
        let rows = self.rows.read();
        Ok(rows
            .values()
            .filter(|r| !status_in(&r.status, statuses))
            .count() as i64)
    }

    async fn next_launchable(&self, statuses: &[String]) -> Result<Option<JobRequest>, StoreError> {
        let rows = self.rows.read();
        let mut candidates: Vec<&JobRequest> = rows
            .values()
            .filter(|r| status_in(&r.status, statuses))
            .collect();
        // scheduled before ad-hoc, then oldest first
        candidates.sort_by_key(|r| (r.job_type != JobType::Scheduled, r.date_queued));
        Ok(candidates.first().map(|r| (*r).clone()))
    }

    async fn latest_scheduled(&self) -> Result<Option<JobRequest>, StoreError> {
        let rows = self.rows.read();
        Ok(rows
            .values()
            .filter(|r| r.job_type == JobType::Scheduled)
            .max_by_key(|r| r.date_queued)
            .cloned())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, r| {
            match r.date_completed.or(r.date_failed) {
                Some(done) => done >= cutoff,
                None => true,
            }
        });
        Ok((before - rows.len()) as u64)
    }
}
