//! # Schedule Next Download
//!
//! Standalone task that keeps the download stage fed: it enqueues job
//! requests covering the time since the last scheduled request's window
//! ended. Steady state produces one chunk-sized request; a large gap (cold
//! start, long outage) is split into backfill chunks so no single request
//! covers an unbounded window.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, trace};

use super::settings::{ScheduleUnit, TaskSettings};
use super::task::{LaunchArgs, Preflight, PreflightContext, StandaloneTask, WorkerContext};
use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::store::{JobStore, JobType, NewJobRequest};

pub const NAME: &str = "Schedule Downloads";

/// Enqueues the next scheduled download request(s).
pub struct ScheduleNextDownload;

/// End of the most recently queued scheduled request's window, or the
/// initial backfill horizon if the store has none.
async fn last_download_time(
    store: &dyn JobStore,
    config: &ScheduleConfig,
) -> Result<DateTime<Utc>> {
    let last = store.latest_scheduled().await?;
    Ok(match last {
        Some(request) => request.window_end,
        None => Utc::now() - Duration::days(config.initial_backfill_days),
    })
}

/// Split `[start, end)` into chunks of at most `chunk_hours`.
fn chunk_ranges(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk_hours: i64,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let chunk = Duration::hours(chunk_hours.max(1));
    let mut ranges = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + chunk).min(end);
        ranges.push((cursor, next));
        cursor = next;
    }
    ranges
}

#[async_trait]
impl StandaloneTask for ScheduleNextDownload {
    fn settings(&self) -> TaskSettings {
        TaskSettings::standalone(
            NAME,
            "Schedules the next feed download requests.",
            10,
            10,
            ScheduleUnit::Seconds,
        )
    }

    /// Enqueue only when the gap since the last scheduled window is large
    /// enough; prevents runaway enqueue during catch-up.
    async fn preflight(
        &self,
        _settings: &TaskSettings,
        cx: &PreflightContext,
    ) -> Result<Preflight> {
        let last = last_download_time(cx.store.as_ref(), &cx.config.schedule).await?;
        let now = Utc::now();
        if last < now && now - last > Duration::hours(cx.config.schedule.min_gap_hours) {
            Ok(Preflight::Launch(LaunchArgs::Standalone))
        } else {
            trace!(last_download_time = %last, "gap too small");
            Ok(Preflight::skip("last download less than the minimum gap ago"))
        }
    }

    async fn run(&self, _settings: &TaskSettings, cx: &WorkerContext) -> Result<()> {
        let config = &cx.config.schedule;
        // recomputed here: the preflight decision was made in the parent
        // process and the store may have moved on since
        let last = last_download_time(cx.store.as_ref(), config).await?;
        let now = Utc::now();

        if now - last < Duration::hours(config.time_chunk_size_hours_backfill) {
            // steady state: one chunk-sized request
            let end = last + Duration::hours(config.time_chunk_size_hours);
            let request = cx
                .store
                .insert(NewJobRequest::generate(JobType::Scheduled, last, end))
                .await?;
            info!(request_id = %request.request_id, window_start = %last, window_end = %end, "scheduled next download");
        } else {
            // backfill: chunked requests up to an hour ago
            let range_end = now - Duration::hours(1);
            let ranges = chunk_ranges(last, range_end, config.time_chunk_size_hours_backfill);
            debug!(chunks = ranges.len(), "backfill scheduling");
            for (start, end) in ranges {
                cx.update_heartbeat();
                let request = cx
                    .store
                    .insert(NewJobRequest::generate(JobType::Scheduled, start, end))
                    .await?;
                info!(request_id = %request.request_id, window_start = %start, window_end = %end, "scheduled backfill download");
            }
        }
        Ok(())
    }
}
