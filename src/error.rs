//! # Engine Error Types
//!
//! Structured error handling for the pipeline engine using thiserror,
//! following the taxonomy in the error handling design: transient store
//! errors, stage logic errors, and configuration/process faults. Liveness
//! violations are not errors — they are detected and resolved by the
//! watchdog.

use thiserror::Error;

use crate::store::StoreError;

/// Crate-wide error type for orchestrator operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A store operation failed. Transient by policy: the current operation
    /// is aborted and retried on a later scheduler tick.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Business logic inside a stage `run` failed. Caught by the worker
    /// wrapper, which quarantines the request directory.
    #[error("stage error: {stage}: {message}")]
    Stage { stage: String, message: String },

    #[error("filesystem error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker process error: {task}: {message}")]
    Process { task: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a stage logic error.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a filesystem error with a human-readable context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a worker process error.
    pub fn process(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Process {
            task: task.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
