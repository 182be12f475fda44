//! # Cleaner
//!
//! Standalone housekeeping task. Deletes job request rows past their TTL
//! and, when disk usage crosses the configured threshold, reaps old
//! request directories across every working directory — starting with the
//! oldest (31 days) and tightening down to 2 days until usage drops back
//! under the threshold.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sysinfo::Disks;
use tracing::{debug, info, trace, warn};

use super::settings::{ScheduleUnit, TaskSettings};
use super::task::{StandaloneTask, WorkerContext};
use crate::error::Result;

pub const NAME: &str = "Cleaner";

/// Oldest directory age the reaper starts from, in days.
const REAP_START_DAYS: u64 = 31;
/// Youngest directory age the reaper will ever remove, in days.
const REAP_FLOOR_DAYS: u64 = 2;

/// Cleans the filesystem and the job state store.
pub struct Cleaner;

/// Percent of the filesystem holding `path` currently in use. `None` when
/// no disk covers the path (containerized mounts can hide it).
pub fn disk_percent_used(path: &Path) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, f64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) && disk.total_space() > 0 {
            let depth = mount.components().count();
            let used = disk.total_space() - disk.available_space();
            let percent = used as f64 / disk.total_space() as f64 * 100.0;
            if best.map_or(true, |(d, _)| depth > d) {
                best = Some((depth, percent));
            }
        }
    }
    best.map(|(_, percent)| percent)
}

/// Remove request directories older than `max_age_seconds` from every
/// working directory under `base_path`. Errors on individual directories
/// are logged and skipped.
fn clean_directories(base_path: &Path, max_age_seconds: u64) {
    let Ok(entries) = fs::read_dir(base_path) else {
        return;
    };
    for entry in entries.flatten() {
        let working_dir = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !working_dir.is_dir() || !name.ends_with("_working_dir") {
            continue;
        }

        let Ok(request_dirs) = fs::read_dir(&working_dir) else {
            continue;
        };
        for request_entry in request_dirs.flatten() {
            let request_dir = request_entry.path();
            if !request_dir.is_dir() {
                continue;
            }
            let age_seconds = request_entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .map_or(0, |age| age.as_secs());
            if age_seconds > max_age_seconds {
                info!(
                    directory = %request_dir.display(),
                    age_seconds,
                    max_age_seconds,
                    "removing expired request directory"
                );
                if let Err(e) = fs::remove_dir_all(&request_dir) {
                    warn!(directory = %request_dir.display(), error = %e, "directory removal failed");
                }
            }
        }
    }
}

#[async_trait]
impl StandaloneTask for Cleaner {
    fn settings(&self) -> TaskSettings {
        TaskSettings::standalone(
            NAME,
            "Cleans the filesystem and the job state store.",
            20,
            15,
            ScheduleUnit::Minutes,
        )
    }

    async fn run(&self, _settings: &TaskSettings, cx: &WorkerContext) -> Result<()> {
        // store rows past their TTL
        let ttl = Duration::seconds(cx.config.cleaner.max_ttl_job_request_seconds);
        match cx.store.delete_finished_before(Utc::now() - ttl).await {
            Ok(removed) if removed > 0 => {
                info!(removed, "expired job requests deleted");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "job request cleanup failed"),
        }

        // directories, only under disk pressure, oldest first
        let base_path = cx.config.pipeline.base_path.clone();
        let threshold = cx.config.cleaner.max_disk_percent_usage;
        for days in (REAP_FLOOR_DAYS..=REAP_START_DAYS).rev() {
            cx.update_heartbeat();
            let Some(percent_used) = disk_percent_used(&base_path) else {
                debug!(base_path = %base_path.display(), "disk usage unavailable, skipping reap");
                break;
            };
            if percent_used < threshold {
                trace!(percent_used, threshold, "disk usage under threshold");
                break;
            }
            info!(percent_used, days, "disk pressure, reaping request directories");
            clean_directories(&base_path, days * 24 * 60 * 60);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::EngineConfig;
    use crate::process::HeartbeatCell;
    use crate::store::{DateStamp, JobStore, JobType, MemoryJobStore, NewJobRequest};

    #[test]
    fn clean_directories_spares_young_dirs_and_files() {
        let base = tempfile::tempdir().unwrap();
        let working = base.path().join("download_working_dir");
        let young = working.join("0#1#young");
        std::fs::create_dir_all(&young).unwrap();
        std::fs::write(working.join("PAUSE"), b"").unwrap();
        let unrelated = base.path().join("not_a_queue");
        std::fs::create_dir_all(&unrelated).unwrap();

        // everything here is seconds old; a zero-age threshold would reap,
        // a one-day threshold must not
        clean_directories(base.path(), 24 * 60 * 60);
        assert!(young.exists());
        assert!(working.join("PAUSE").exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn run_deletes_expired_job_requests() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let mut config = EngineConfig::default();
        config.pipeline.base_path = base.path().to_path_buf();
        // nothing survives the TTL once finished
        config.cleaner.max_ttl_job_request_seconds = -1;
        let cx = WorkerContext {
            store: store.clone(),
            config: Arc::new(config),
            heartbeat: HeartbeatCell::create(&base.path().join("heartbeats"), "cleaner").unwrap(),
        };

        let now = Utc::now();
        let finished = store
            .insert(NewJobRequest::generate(JobType::Scheduled, now, now))
            .await
            .unwrap();
        store
            .set_status(&finished.request_id, "upload complete", &[DateStamp::Completed])
            .await
            .unwrap();
        let open = store
            .insert(NewJobRequest::generate(JobType::Scheduled, now, now))
            .await
            .unwrap();

        let task = Cleaner;
        task.run(&task.settings(), &cx).await.unwrap();

        assert!(store.get(&finished.request_id).await.unwrap().is_none());
        assert!(store.get(&open.request_id).await.unwrap().is_some());
    }
}
