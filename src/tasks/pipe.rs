//! # Pipeline Stage Lifecycle
//!
//! The worker-side state machine for one pipeline stage working one
//! request: mark active → resolve directories → run the stage → mark
//! complete and move the request directory forward, or mark failed and
//! quarantine it. Every transition here runs inside the worker process;
//! the scheduler only ever observes the store and the queues.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::{error, info};

use super::request_dir;
use super::settings::TaskSettings;
use super::task::{PipeTask, StageIo, WorkerContext};
use crate::constants::{Priority, STATUS_FAILED};
use crate::error::{EngineError, Result};
use crate::store::DateStamp;

/// How a stage invocation ended. Transition-machinery failures (store
/// unreachable while quarantining, say) surface as `Err` from
/// [`run_pipe_task`]; business failures are `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed,
}

/// Run the full stage lifecycle for one request.
///
/// `request_dir` is `None` only for the pipe's first stage, which
/// materializes a fresh directory itself (cleaning any stale directory for
/// the same request id first).
pub async fn run_pipe_task(
    work: &dyn PipeTask,
    settings: &TaskSettings,
    cx: &WorkerContext,
    request_id: &str,
    request_dir: Option<PathBuf>,
    priority: Priority,
) -> Result<StageOutcome> {
    let pipe = settings.pipe().ok_or_else(|| {
        EngineError::Configuration(format!("{} is not a pipe task", settings.name))
    })?;
    cx.update_heartbeat();

    // mark active; any error here aborts straight to the failed transition
    if let Err(e) = stage_start(settings, cx, request_id).await {
        error!(task = %settings.name, request_id, error = %e, "task start failed");
        stage_failed(settings, cx, request_id, request_dir.as_deref()).await;
        return Ok(StageOutcome::Failed);
    }

    // the first stage creates the request directory it will work in
    let request_dir = if pipe.is_pipe_first {
        let input_dir = settings
            .input_dir()
            .ok_or_else(|| EngineError::Configuration("pipe task without input dir".into()))?;
        match request_dir::create_request_dir(
            &input_dir,
            request_id,
            priority,
            cx.config.pipeline.separator_char(),
        ) {
            Ok(dir) => dir,
            Err(e) => {
                error!(task = %settings.name, request_id, error = %e, "request dir creation failed");
                stage_failed(settings, cx, request_id, None).await;
                return Ok(StageOutcome::Failed);
            }
        }
    } else {
        match request_dir {
            Some(dir) => dir,
            None => {
                error!(task = %settings.name, request_id, "no request dir for non-first stage");
                stage_failed(settings, cx, request_id, None).await;
                return Ok(StageOutcome::Failed);
            }
        }
    };

    let io = match stage_setup(settings, &request_dir, request_id) {
        Ok(io) => io,
        Err(e) => {
            error!(task = %settings.name, request_id, error = %e, "stage setup failed");
            stage_failed(settings, cx, request_id, Some(&request_dir)).await;
            return Ok(StageOutcome::Failed);
        }
    };

    match work.run(settings, cx, &io).await {
        Ok(()) => match stage_complete(settings, cx, request_id, &request_dir).await {
            Ok(()) => Ok(StageOutcome::Completed),
            Err(e) => {
                error!(task = %settings.name, request_id, error = %e, "complete transition failed");
                stage_failed(settings, cx, request_id, Some(&request_dir)).await;
                Ok(StageOutcome::Failed)
            }
        },
        Err(e) => {
            error!(task = %settings.name, request_id, error = %e, "task failed");
            stage_failed(settings, cx, request_id, Some(&request_dir)).await;
            Ok(StageOutcome::Failed)
        }
    }
}

/// Resolve stage input/output inside the request directory. The output
/// subdirectory is recreated fresh so partial prior attempts cannot leak
/// through.
fn stage_setup(settings: &TaskSettings, request_dir: &Path, request_id: &str) -> Result<StageIo> {
    let input_name = settings
        .input_data_dir_name()
        .ok_or_else(|| EngineError::Configuration(format!("{}: previous task not set", settings.name)))?;
    let input_dir = request_dir.join(input_name);
    let output_dir = request_dir.join(settings.data_dir_name());
    request_dir::fresh_dir(&output_dir)?;
    Ok(StageIo {
        request_id: request_id.to_string(),
        input_dir,
        output_dir,
    })
}

/// Mark the request active for this stage and stamp the stage start
/// (plus overall started for the pipe's first stage).
async fn stage_start(settings: &TaskSettings, cx: &WorkerContext, request_id: &str) -> Result<()> {
    let pipe = settings
        .pipe()
        .ok_or_else(|| EngineError::Configuration("not a pipe task".into()))?;
    let mut stamps = vec![DateStamp::StageStart(settings.name_snake())];
    if pipe.is_pipe_first {
        stamps.push(DateStamp::Started);
    }
    cx.store
        .set_status(request_id, &settings.status_active(), &stamps)
        .await?;
    info!(task = %settings.slug(), request_id, status = %settings.status_active(), "stage start");
    Ok(())
}

/// Mark the request complete for this stage and move its directory to the
/// next stage's queue (the done directory for the last stage).
async fn stage_complete(
    settings: &TaskSettings,
    cx: &WorkerContext,
    request_id: &str,
    request_dir: &Path,
) -> Result<()> {
    let pipe = settings
        .pipe()
        .ok_or_else(|| EngineError::Configuration("not a pipe task".into()))?;
    let mut stamps = vec![DateStamp::StageComplete(settings.name_snake())];
    if pipe.is_pipe_last {
        stamps.push(DateStamp::Completed);
    }
    cx.store
        .set_status(request_id, &settings.status_complete(), &stamps)
        .await?;

    let output_dir = pipe
        .output_dir
        .clone()
        .ok_or_else(|| EngineError::Configuration(format!("{}: output dir not wired", settings.name)))?;
    let moved = request_dir::move_request_dir(request_dir, &output_dir)?;
    info!(
        task = %settings.slug(),
        request_id,
        to = %moved.display(),
        "stage complete, request dir moved"
    );
    Ok(())
}

/// Best-effort failed transition: mark the request failed (logged if even
/// that fails) and quarantine the request directory.
async fn stage_failed(
    settings: &TaskSettings,
    cx: &WorkerContext,
    request_id: &str,
    request_dir: Option<&Path>,
) {
    if let Err(e) = cx
        .store
        .set_status(request_id, STATUS_FAILED, &[DateStamp::Failed])
        .await
    {
        error!(task = %settings.name, request_id, error = %e, "failed to mark request failed");
    }

    let Some(request_dir) = request_dir else {
        return;
    };
    let Some(failed_dir) = settings.failed_dir() else {
        return;
    };
    match request_dir::move_request_dir(request_dir, &failed_dir) {
        Ok(dest) => {
            error!(
                task = %settings.name,
                request_id,
                quarantine = %dest.display(),
                "request dir quarantined"
            );
        }
        Err(e) => {
            error!(task = %settings.name, request_id, error = %e, "quarantine move failed");
        }
    }
}

/// Write stage results as a gzip-JSON file in the output directory,
/// updating the heartbeat first. File names sort by creation time so the
/// next stage processes them in order.
pub fn write_results(
    cx: &WorkerContext,
    data: &Value,
    output_dir: &Path,
    kind: &str,
) -> Result<PathBuf> {
    cx.update_heartbeat();

    let separator = cx.config.pipeline.separator_char();
    let mut token = request_dir::timestamp_token();
    let mut path = output_dir.join(format!("{token}{separator}{kind}.json.gz"));
    while path.exists() {
        // two writes inside the same clock tick; keep names unique
        token += 1;
        path = output_dir.join(format!("{token}{separator}{kind}.json.gz"));
    }

    let file = std::fs::File::create(&path)
        .map_err(|e| EngineError::io(format!("creating {}", path.display()), e))?;
    let mut encoder = GzEncoder::new(file, Compression::best());
    encoder
        .write_all(serde_json::to_string(data)?.as_bytes())
        .map_err(|e| EngineError::io(format!("writing {}", path.display()), e))?;
    encoder
        .finish()
        .map_err(|e| EngineError::io(format!("finishing {}", path.display()), e))?;
    Ok(path)
}

/// Read one gzip-JSON result file written by [`write_results`].
pub fn read_results(path: &Path) -> Result<Value> {
    let file = std::fs::File::open(path)
        .map_err(|e| EngineError::io(format!("opening {}", path.display()), e))?;
    let mut decoder = GzDecoder::new(file);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|e| EngineError::io(format!("decompressing {}", path.display()), e))?;
    Ok(serde_json::from_str(&text)?)
}

/// Result files of a given kind in a stage input directory, sorted by
/// name (creation order).
pub fn result_files(input_dir: &Path, kind: &str) -> Result<Vec<PathBuf>> {
    if !input_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(input_dir)
        .map_err(|e| EngineError::io(format!("listing {}", input_dir.display()), e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(kind))
        })
        .collect();
    files.sort();
    Ok(files)
}
