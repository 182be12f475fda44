//! # Convert Stage
//!
//! Reads the download stage's result files, applies the platform record
//! transform, and writes batch files for the upload stage. Batches are
//! chunked so a single oversized submission cannot stall the uploader.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::pipe::{read_results, result_files, write_results};
use super::settings::{ScheduleUnit, TaskSettings};
use super::task::{PipeTask, StageIo, WorkerContext};
use crate::error::Result;
use crate::feed::RecordTransform;
use crate::store::CountField;

pub const NAME: &str = "Convert";

/// Records per batch file.
const BATCH_CHUNK_SIZE: usize = 5_000;

/// Converts provider records into platform batch files.
pub struct ConvertStage {
    transform: Arc<dyn RecordTransform>,
    base_path: std::path::PathBuf,
}

impl ConvertStage {
    pub fn new(transform: Arc<dyn RecordTransform>, base_path: std::path::PathBuf) -> Self {
        Self {
            transform,
            base_path,
        }
    }
}

#[async_trait]
impl PipeTask for ConvertStage {
    fn settings(&self) -> TaskSettings {
        TaskSettings::new_pipe(
            NAME,
            "Converts downloaded feed records to the platform batch format.",
            30,
            5,
            ScheduleUnit::Seconds,
            self.base_path.clone(),
        )
    }

    async fn run(&self, _settings: &TaskSettings, cx: &WorkerContext, io: &StageIo) -> Result<()> {
        let mut converted = 0i64;

        for file in result_files(&io.input_dir, "indicators")? {
            let contents = read_results(&file)?;
            let records = match contents {
                Value::Array(records) if !records.is_empty() => records,
                _ => continue,
            };

            let batch: Vec<Value> = records
                .iter()
                .filter_map(|record| self.transform.transform(record))
                .collect();
            if batch.is_empty() {
                continue;
            }
            converted += batch.len() as i64;

            // write_results updates the heartbeat per chunk
            for chunk in batch.chunks(BATCH_CHUNK_SIZE) {
                write_results(cx, &json!({ "indicator": chunk }), &io.output_dir, "batch")?;
            }
        }

        cx.store
            .increment_counts(&io.request_id, &[(CountField::ConvertIndicator, converted)])
            .await?;
        debug!(request_id = %io.request_id, converted, "convert finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::config::EngineConfig;
    use crate::feed::IdentityTransform;
    use crate::process::HeartbeatCell;
    use crate::store::{JobStore, JobType, MemoryJobStore, NewJobRequest};

    /// Drops records without an id, rewrites the rest.
    struct IdOnlyTransform;

    impl RecordTransform for IdOnlyTransform {
        fn transform(&self, record: &Value) -> Option<Value> {
            record.get("id").map(|id| json!({ "summary": id }))
        }
    }

    fn worker_context(base: &Path, store: Arc<MemoryJobStore>) -> WorkerContext {
        let mut config = EngineConfig::default();
        config.pipeline.base_path = base.to_path_buf();
        WorkerContext {
            store,
            config: Arc::new(config),
            heartbeat: HeartbeatCell::create(&base.join("heartbeats"), "convert").unwrap(),
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
    async fn converts_and_counts_transformable_records() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let cx = worker_context(base.path(), store.clone());
        let request_id = request_id(&store).await;

        let input = base.path().join("in");
        let output = base.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        write_results(
            &cx,
            &json!([{"id": 1}, {"id": 2}, {"no_id": true}]),
            &input,
            "indicators",
        )
        .unwrap();

        let stage = ConvertStage::new(Arc::new(IdOnlyTransform), base.path().to_path_buf());
        let io = StageIo {
            request_id: request_id.clone(),
            input_dir: input,
            output_dir: output.clone(),
        };
        stage.run(&stage.settings(), &cx, &io).await.unwrap();

        let batches = result_files(&output, "batch").unwrap();
        assert_eq!(batches.len(), 1);
        let batch = read_results(&batches[0]).unwrap();
        assert_eq!(batch["indicator"].as_array().unwrap().len(), 2);

        let row = store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(row.counts.convert_indicator, 2);
    }

    #[tokio::test]
    async fn empty_input_writes_no_batches() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let cx = worker_context(base.path(), store.clone());
        let request_id = request_id(&store).await;

        let input = base.path().join("in");
        let output = base.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        write_results(&cx, &json!([]), &input, "indicators").unwrap();

        let stage = ConvertStage::new(Arc::new(IdentityTransform), base.path().to_path_buf());
        let io = StageIo {
            request_id,
            input_dir: input,
            output_dir: output.clone(),
        };
        stage.run(&stage.settings(), &cx, &io).await.unwrap();
        assert!(result_files(&output, "batch").unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_inputs_chunk_into_multiple_batches() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let cx = worker_context(base.path(), store.clone());
        let request_id = request_id(&store).await;

        let input = base.path().join("in");
        let output = base.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        let records: Vec<Value> = (0..BATCH_CHUNK_SIZE + 1).map(|i| json!({"id": i})).collect();
        write_results(&cx, &Value::Array(records), &input, "indicators").unwrap();

        let stage = ConvertStage::new(Arc::new(IdentityTransform), base.path().to_path_buf());
        let io = StageIo {
            request_id,
            input_dir: input,
            output_dir: output.clone(),
        };
        stage.run(&stage.settings(), &cx, &io).await.unwrap();
        assert_eq!(result_files(&output, "batch").unwrap().len(), 2);
    }
}
