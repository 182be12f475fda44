//! # Download Stage
//!
//! First pipeline stage. Work comes from the job request table rather than
//! an input queue: the preflight check selects the oldest launchable
//! request, preferring scheduled over ad-hoc job types, and is throttled by
//! the number of open requests so unconsumed data cannot pile up on disk
//! faster than downstream stages drain it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use super::pipe::write_results;
use super::settings::{ScheduleUnit, TaskSettings};
use super::task::{LaunchArgs, PipeTask, Preflight, PreflightContext, StageIo, WorkerContext};
use crate::constants::{Priority, STATUS_CANCELLED, STATUS_FAILED, STATUS_PENDING};
use crate::error::{EngineError, Result};
use crate::feed::{FeedProvider, TimeWindow};
use crate::store::{CountField, JobType};

pub const NAME: &str = "Download";

/// Downloads feed records for a request's time window and hands them to
/// the convert stage.
pub struct DownloadStage {
    provider: Arc<dyn FeedProvider>,
    base_path: std::path::PathBuf,
}

impl DownloadStage {
    pub fn new(provider: Arc<dyn FeedProvider>, base_path: std::path::PathBuf) -> Self {
        Self {
            provider,
            base_path,
        }
    }

    /// Statuses that do not count against the throttle limit: requests not
    /// yet started, already failed or cancelled, and requests that reached
    /// a pipeline's terminal label.
    fn throttle_exempt(cx: &PreflightContext) -> Vec<String> {
        let mut statuses = vec![
            STATUS_CANCELLED.to_string(),
            STATUS_FAILED.to_string(),
            STATUS_PENDING.to_string(),
        ];
        statuses.extend(cx.terminal_statuses.iter().cloned());
        statuses
    }
}

#[async_trait]
impl PipeTask for DownloadStage {
    fn settings(&self) -> TaskSettings {
        TaskSettings::new_pipe(
            NAME,
            "Downloads feed records from the provider for each job request window.",
            20,
            5,
            ScheduleUnit::Seconds,
            self.base_path.clone(),
        )
    }

    /// Launch only when a launchable request exists and the number of open
    /// requests is under the throttle limit.
    async fn preflight(
        &self,
        settings: &TaskSettings,
        cx: &PreflightContext,
    ) -> Result<Preflight> {
        let open = cx
            .store
            .count_not_in_status(&Self::throttle_exempt(cx))
            .await?;
        if open >= cx.config.pipeline.throttle_limit {
            trace!(
                open,
                limit = cx.config.pipeline.throttle_limit,
                "throttle limit hit"
            );
            return Ok(Preflight::skip("throttle limit hit"));
        }

        // pending requests, plus in-progress ones left behind by a killed
        // worker so they get retried
        let launchable = vec![STATUS_PENDING.to_string(), settings.status_active()];
        match cx.store.next_launchable(&launchable).await? {
            Some(request) => {
                debug!(request_id = %request.request_id, job_type = ?request.job_type, "download selected");
                let priority = if request.job_type == JobType::AdHoc {
                    Priority::Low
                } else {
                    Priority::High
                };
                Ok(Preflight::Launch(LaunchArgs::Pipe {
                    request_id: request.request_id,
                    request_dir: None,
                    priority,
                }))
            }
            None => Ok(Preflight::skip("no pending job request found")),
        }
    }

    async fn run(&self, settings: &TaskSettings, cx: &WorkerContext, io: &StageIo) -> Result<()> {
        // look the record up in the worker process, never through state
        // inherited from the parent
        let request = cx
            .store
            .get(&io.request_id)
            .await?
            .ok_or_else(|| EngineError::stage(settings.name.clone(), "job request missing"))?;

        let window = TimeWindow {
            start: request.window_start,
            end: request.window_end,
        };
        let records = self.provider.fetch(&window).await?;
        let count = records.len() as i64;

        write_results(cx, &Value::Array(records), &io.output_dir, "indicators")?;

        cx.store
            .increment_counts(&io.request_id, &[(CountField::DownloadIndicator, count)])
            .await?;
        debug!(request_id = %io.request_id, count, "download finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::config::EngineConfig;
    use crate::store::{JobStore, MemoryJobStore, NewJobRequest};

    struct EmptyProvider;

    #[async_trait]
    impl FeedProvider for EmptyProvider {
        async fn fetch(&self, _window: &TimeWindow) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn stage() -> DownloadStage {
        DownloadStage::new(Arc::new(EmptyProvider), PathBuf::from("/tmp/engine"))
    }

    fn preflight_context(store: Arc<MemoryJobStore>, throttle_limit: i64) -> PreflightContext {
        let mut config = EngineConfig::default();
        config.pipeline.throttle_limit = throttle_limit;
        PreflightContext {
            store,
            config: Arc::new(config),
            terminal_statuses: Arc::new(vec!["upload complete".to_string()]),
        }
    }

    async fn queued(store: &MemoryJobStore, job_type: JobType) -> String {
        let now = chrono::Utc::now();
        store
            .insert(NewJobRequest::generate(
                job_type,
                now - chrono::Duration::hours(1),
                now,
            ))
            .await
            .unwrap()
            .request_id
    }

    #[tokio::test]
    async fn empty_store_skips() {
        let store = Arc::new(MemoryJobStore::new());
        let stage = stage();
        let settings = stage.settings();
        let cx = preflight_context(store, 3);
        assert!(matches!(
            stage.preflight(&settings, &cx).await.unwrap(),
            Preflight::Skip(_)
        ));
    }

    #[tokio::test]
    async fn scheduled_selected_before_older_adhoc() {
        let store = Arc::new(MemoryJobStore::new());
        queued(&store, JobType::AdHoc).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let scheduled = queued(&store, JobType::Scheduled).await;

        let stage = stage();
        let settings = stage.settings();
        let cx = preflight_context(store, 3);
        match stage.preflight(&settings, &cx).await.unwrap() {
            Preflight::Launch(LaunchArgs::Pipe {
                request_id,
                priority,
                ..
            }) => {
                assert_eq!(request_id, scheduled);
                assert_eq!(priority, Priority::High);
            }
            other => panic!("unexpected preflight outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn adhoc_launches_low_priority() {
        let store = Arc::new(MemoryJobStore::new());
        queued(&store, JobType::AdHoc).await;

        let stage = stage();
        let settings = stage.settings();
        let cx = preflight_context(store, 3);
        match stage.preflight(&settings, &cx).await.unwrap() {
            Preflight::Launch(LaunchArgs::Pipe { priority, .. }) => {
                assert_eq!(priority, Priority::Low);
            }
            other => panic!("unexpected preflight outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttle_limit_blocks_launch() {
        let store = Arc::new(MemoryJobStore::new());
        // one open in-flight request, one pending
        let inflight = queued(&store, JobType::Scheduled).await;
        store
            .set_status(&inflight, "convert in progress", &[])
            .await
            .unwrap();
        queued(&store, JobType::Scheduled).await;

        let stage = stage();
        let settings = stage.settings();
        let cx = preflight_context(store.clone(), 1);
        assert!(matches!(
            stage.preflight(&settings, &cx).await.unwrap(),
            Preflight::Skip(_)
        ));

        // terminal labels do not count against the limit
        store
            .set_status(&inflight, "upload complete", &[])
            .await
            .unwrap();
        assert!(matches!(
            stage.preflight(&settings, &cx).await.unwrap(),
            Preflight::Launch(_)
        ));
    }
}
