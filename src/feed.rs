//! # Feed Collaborators
//!
//! Interface boundary to the systems the pipeline moves data between: the
//! upstream feed provider the download stage pulls from, the record
//! transform the convert stage applies, and the batch sink the upload
//! stage submits to. All three are external collaborators — the
//! orchestrator only depends on these traits.
//!
//! Small filesystem-backed implementations ship here so the binary runs
//! end-to-end without external services; real deployments wire their own.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Time window a job request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Upstream source of feed records.
#[async_trait]
pub trait FeedProvider: Send + Sync {
    /// All records last modified inside `window`.
    async fn fetch(&self, window: &TimeWindow) -> Result<Vec<Value>>;
}

/// Converts one provider record into the platform batch format. Returning
/// `None` drops the record.
pub trait RecordTransform: Send + Sync {
    fn transform(&self, record: &Value) -> Option<Value>;
}

/// Result of submitting one batch downstream.
#[derive(Debug, Clone, Default)]
pub struct BatchReceipt {
    pub success_count: i64,
    pub errors: Vec<String>,
}

/// Downstream recipient of converted batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit(&self, batch: &Value) -> Result<BatchReceipt>;
}

/// Provider reading gzip-JSON (or plain JSON) drop files from a directory.
/// Each file holds an array of records carrying a `last_modified` RFC3339
/// field used for window filtering.
pub struct DropDirProvider {
    drop_dir: PathBuf,
}

impl DropDirProvider {
    pub fn new(drop_dir: PathBuf) -> Self {
        Self { drop_dir }
    }

    fn read_records(path: &std::path::Path) -> Result<Vec<Value>> {
        let raw = fs::read(path)
            .map_err(|e| EngineError::io(format!("reading {}", path.display()), e))?;
        let text = if path.extension().is_some_and(|ext| ext == "gz") {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut out = String::new();
            decoder
                .read_to_string(&mut out)
                .map_err(|e| EngineError::io(format!("decompressing {}", path.display()), e))?;
            out
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };
        let value: Value = serde_json::from_str(&text)?;
        match value {
            Value::Array(records) => Ok(records),
            other => Ok(vec![other]),
        }
    }

    fn last_modified(record: &Value) -> Option<DateTime<Utc>> {
        record
            .get("last_modified")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[async_trait]
impl FeedProvider for DropDirProvider {
    async fn fetch(&self, window: &TimeWindow) -> Result<Vec<Value>> {
        if !self.drop_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.drop_dir)
            .map_err(|e| EngineError::io(format!("listing {}", self.drop_dir.display()), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut matched = Vec::new();
        for path in paths {
            for record in Self::read_records(&path)? {
                match Self::last_modified(&record) {
                    Some(at) if window.contains(at) => matched.push(record),
                    // records without a usable timestamp belong to no window
                    _ => {}
                }
            }
        }
        debug!(count = matched.len(), "drop dir fetch");
        Ok(matched)
    }
}

/// Pass-through transform.
pub struct IdentityTransform;

impl RecordTransform for IdentityTransform {
    fn transform(&self, record: &Value) -> Option<Value> {
        Some(record.clone())
    }
}

/// Sink writing each submitted batch as a JSON file into an outbox
/// directory, for pickup by the platform uploader.
pub struct OutboxSink {
    outbox_dir: PathBuf,
}

impl OutboxSink {
    pub fn new(outbox_dir: PathBuf) -> Self {
        Self { outbox_dir }
    }
}

#[async_trait]
impl BatchSink for OutboxSink {
    async fn submit(&self, batch: &Value) -> Result<BatchReceipt> {
        fs::create_dir_all(&self.outbox_dir)
            .map_err(|e| EngineError::io(format!("creating {}", self.outbox_dir.display()), e))?;

        let name = format!("{}.json", crate::tasks::request_dir::timestamp_token());
        let path = self.outbox_dir.join(name);
        let mut file = fs::File::create(&path)
            .map_err(|e| EngineError::io(format!("creating {}", path.display()), e))?;
        file.write_all(serde_json::to_string(batch)?.as_bytes())
            .map_err(|e| EngineError::io(format!("writing {}", path.display()), e))?;

        let success_count = batch
            .get("indicator")
            .and_then(Value::as_array)
            .map_or(0, |records| records.len() as i64);
        Ok(BatchReceipt {
            success_count,
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn window(hours_ago_start: i64, hours_ago_end: i64) -> TimeWindow {
        let now = Utc::now();
        TimeWindow {
            start: now - chrono::Duration::hours(hours_ago_start),
            end: now - chrono::Duration::hours(hours_ago_end),
        }
    }

    #[tokio::test]
    async fn drop_dir_provider_filters_by_window() {
        let dir = tempfile::tempdir().unwrap();
        let inside = (Utc::now() - chrono::Duration::minutes(90)).to_rfc3339();
        let outside = (Utc::now() - chrono::Duration::hours(50)).to_rfc3339();
        let records = json!([
            {"id": "in", "last_modified": inside},
            {"id": "out", "last_modified": outside},
            {"id": "undated"},
        ]);
        std::fs::write(dir.path().join("drop.json"), records.to_string()).unwrap();

        let provider = DropDirProvider::new(dir.path().to_path_buf());
        let fetched = provider.fetch(&window(2, 0)).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0]["id"], "in");
    }

    #[tokio::test]
    async fn missing_drop_dir_is_empty_not_an_error() {
        let provider = DropDirProvider::new(PathBuf::from("/nonexistent/drops"));
        assert!(provider.fetch(&window(1, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbox_sink_counts_indicators() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutboxSink::new(dir.path().join("outbox"));
        let receipt = sink
            .submit(&json!({"indicator": [{"id": 1}, {"id": 2}]}))
            .await
            .unwrap();
        assert_eq!(receipt.success_count, 2);
        assert!(receipt.errors.is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("outbox")).unwrap().count(), 1);
    }
}
