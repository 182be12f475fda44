//! # Upload Stage
//!
//! Last pipeline stage: submits the convert stage's batch files to the
//! platform sink. Success and error counts land on the job request row;
//! per-batch errors are also written into the request directory so a
//! quarantined request carries its own diagnosis.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::pipe::{read_results, result_files, write_results};
use super::settings::{ScheduleUnit, TaskSettings};
use super::task::{PipeTask, StageIo, WorkerContext};
use crate::error::Result;
use crate::feed::BatchSink;
use crate::store::CountField;

pub const NAME: &str = "Upload";

/// Submits converted batches downstream.
pub struct UploadStage {
    sink: Arc<dyn BatchSink>,
    base_path: std::path::PathBuf,
}

impl UploadStage {
    pub fn new(sink: Arc<dyn BatchSink>, base_path: std::path::PathBuf) -> Self {
        Self { sink, base_path }
    }
}

#[async_trait]
impl PipeTask for UploadStage {
    fn settings(&self) -> TaskSettings {
        TaskSettings::new_pipe(
            NAME,
            "Submits converted batches to the platform.",
            30,
            5,
            ScheduleUnit::Seconds,
            self.base_path.clone(),
        )
    }

    async fn run(&self, _settings: &TaskSettings, cx: &WorkerContext, io: &StageIo) -> Result<()> {
        // a retried upload starts its counters from zero
        cx.store
            .reset_counts(
                &io.request_id,
                &[CountField::UploadSuccess, CountField::UploadError],
            )
            .await?;

        let mut success = 0i64;
        let mut errors: Vec<String> = Vec::new();

        for file in result_files(&io.input_dir, "batch")? {
            cx.update_heartbeat();
            let batch = read_results(&file)?;
            let receipt = self.sink.submit(&batch).await?;
            success += receipt.success_count;
            if !receipt.errors.is_empty() {
                warn!(
                    request_id = %io.request_id,
                    batch = %file.display(),
                    errors = receipt.errors.len(),
                    "batch submitted with errors"
                );
                errors.extend(receipt.errors);
            }
        }

        if !errors.is_empty() {
            write_results(cx, &json!(errors), &io.output_dir, "batch-errors")?;
        }

        cx.store
            .increment_counts(
                &io.request_id,
                &[
                    (CountField::UploadSuccess, success),
                    (CountField::UploadError, errors.len() as i64),
                ],
            )
            .await?;
        debug!(request_id = %io.request_id, success, errors = errors.len(), "upload finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use parking_lot::Mutex;
    use serde_json::Value;

    use crate::config::EngineConfig;
    use crate::feed::BatchReceipt;
    use crate::process::HeartbeatCell;
    use crate::store::{JobStore, JobType, MemoryJobStore, NewJobRequest};

    /// Captures submissions; errors on batches flagged `"poison": true`.
    #[derive(Default)]
    struct CapturingSink {
        submitted: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl BatchSink for CapturingSink {
        async fn submit(&self, batch: &Value) -> Result<BatchReceipt> {
            self.submitted.lock().push(batch.clone());
            if batch.get("poison").is_some() {
                return Ok(BatchReceipt {
                    success_count: 0,
                    errors: vec!["0x1005: Invalid Indicator Error".to_string()],
                });
            }
            let count = batch
                .get("indicator")
                .and_then(Value::as_array)
                .map_or(0, |a| a.len() as i64);
            Ok(BatchReceipt {
                success_count: count,
                errors: Vec::new(),
            })
        }
    }

    fn worker_context(base: &Path, store: Arc<MemoryJobStore>) -> WorkerContext {
        let mut config = EngineConfig::default();
        config.pipeline.base_path = base.to_path_buf();
        WorkerContext {
            store,
            config: Arc::new(config),
            heartbeat: HeartbeatCell::create(&base.join("heartbeats"), "upload").unwrap(),
        }
    }

    async fn request_id(store: &MemoryJobStore) -> String {
        let now = chrono::Utc::now();
        store
            .insert(NewJobRequest::generate(
                JobType::Scheduled,
                now - chrono::Duration::hours(1),
                now,
            ))
            .await
            .unwrap()
            .request_id
    }

    #[tokio::test]
    async fn submits_batches_and_counts_successes() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let cx = worker_context(base.path(), store.clone());
        let request_id = request_id(&store).await;

        let input = base.path().join("in");
        let output = base.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        write_results(&cx, &json!({"indicator": [{"id": 1}, {"id": 2}]}), &input, "batch").unwrap();
        write_results(&cx, &json!({"indicator": [{"id": 3}]}), &input, "batch").unwrap();

        let sink = Arc::new(CapturingSink::default());
        let stage = UploadStage::new(sink.clone(), base.path().to_path_buf());
        let io = StageIo {
            request_id: request_id.clone(),
            input_dir: input,
            output_dir: output.clone(),
        };
        stage.run(&stage.settings(), &cx, &io).await.unwrap();

        assert_eq!(sink.submitted.lock().len(), 2);
        let row = store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(row.counts.upload_success, 3);
        assert_eq!(row.counts.upload_error, 0);
        assert!(result_files(&output, "batch-errors").unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_errors_are_counted_and_written_to_disk() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let cx = worker_context(base.path(), store.clone());
        let request_id = request_id(&store).await;

        let input = base.path().join("in");
        let output = base.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        write_results(&cx, &json!({"poison": true}), &input, "batch").unwrap();

        let stage = UploadStage::new(
            Arc::new(CapturingSink::default()),
            base.path().to_path_buf(),
        );
        let io = StageIo {
            request_id: request_id.clone(),
            input_dir: input,
            output_dir: output.clone(),
        };
        stage.run(&stage.settings(), &cx, &io).await.unwrap();

        let row = store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(row.counts.upload_error, 1);
        assert_eq!(result_files(&output, "batch-errors").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rerun_resets_counts_before_submitting() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let cx = worker_context(base.path(), store.clone());
        let request_id = request_id(&store).await;

        store
            .increment_counts(&request_id, &[(CountField::UploadError, 4)])
            .await
            .unwrap();

        let input = base.path().join("in");
        let output = base.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();

        let stage = UploadStage::new(
            Arc::new(CapturingSink::default()),
            base.path().to_path_buf(),
        );
        let io = StageIo {
            request_id: request_id.clone(),
            input_dir: input,
            output_dir: output,
        };
        stage.run(&stage.settings(), &cx, &io).await.unwrap();

        let row = store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(row.counts.upload_error, 0);
    }
}
