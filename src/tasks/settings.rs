//! # Task Settings
//!
//! Typed per-task configuration. A task is either standalone or a pipeline
//! stage; the pipe-only fields live in their own struct behind the
//! [`TaskKind`] tagged union rather than being injected dynamically.
//!
//! Slug, snake name, status labels, and working directories are derived
//! functions of `name` — they are never stored, so they can never drift
//! from it.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{FAILED_WORKING_DIR, PAUSE_FILE};

/// Cadence unit for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ScheduleUnit {
    fn seconds(self) -> u64 {
        match self {
            ScheduleUnit::Seconds => 1,
            ScheduleUnit::Minutes => 60,
            ScheduleUnit::Hours => 60 * 60,
            ScheduleUnit::Days => 60 * 60 * 24,
        }
    }
}

/// Pipe-only settings. Adjacency fields (`pipe_index`, `is_pipe_first`,
/// `is_pipe_last`, `previous_task_name`, `output_dir`) are wired by the
/// registry from pipeline list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeSettings {
    /// Base path under which all working directories live.
    pub base_path: PathBuf,
    pub pipe_index: Option<usize>,
    pub is_pipe_first: bool,
    pub is_pipe_last: bool,
    pub previous_task_name: Option<String>,
    /// Where completed request directories move: the next stage's input
    /// queue, or the done directory for the last stage.
    pub output_dir: Option<PathBuf>,
}

impl PipeSettings {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            pipe_index: None,
            is_pipe_first: false,
            is_pipe_last: false,
            previous_task_name: None,
            output_dir: None,
        }
    }
}

/// Whether a task is standalone or chained into a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    Standalone,
    Pipe(PipeSettings),
}

/// Settings owned by each task instance, mutable at runtime (pause flags,
/// pipe adjacency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub name: String,
    pub description: String,
    /// Liveness budget: the watchdog kills a worker whose heartbeat is
    /// older than this.
    pub max_execution_minutes: i64,
    pub schedule_period: u64,
    pub schedule_unit: ScheduleUnit,
    /// Explicit pause set through the control surface.
    pub paused: bool,
    /// Pause requested by a PAUSE file in the task's input directory.
    pub paused_by_file: bool,
    /// Pause requested by the global PAUSE file.
    pub paused_by_global_file: bool,
    pub kind: TaskKind,
}

impl TaskSettings {
    pub fn standalone(
        name: impl Into<String>,
        description: impl Into<String>,
        max_execution_minutes: i64,
        schedule_period: u64,
        schedule_unit: ScheduleUnit,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            max_execution_minutes,
            schedule_period,
            schedule_unit,
            paused: false,
            paused_by_file: false,
            paused_by_global_file: false,
            kind: TaskKind::Standalone,
        }
    }

    pub fn new_pipe(
        name: impl Into<String>,
        description: impl Into<String>,
        max_execution_minutes: i64,
        schedule_period: u64,
        schedule_unit: ScheduleUnit,
        base_path: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            max_execution_minutes,
            schedule_period,
            schedule_unit,
            paused: false,
            paused_by_file: false,
            paused_by_global_file: false,
            kind: TaskKind::Pipe(PipeSettings::new(base_path)),
        }
    }

    /// Easy-to-type name: lower-kebab of `name`.
    pub fn slug(&self) -> String {
        self.name.to_lowercase().replace(' ', "-")
    }

    /// Snake-case name used for directory names.
    pub fn name_snake(&self) -> String {
        self.name.to_lowercase().replace(' ', "_")
    }

    /// Status label while this stage is working a request.
    pub fn status_active(&self) -> String {
        format!("{} in progress", self.name.to_lowercase())
    }

    /// Status label once this stage finished a request.
    pub fn status_complete(&self) -> String {
        format!("{} complete", self.name.to_lowercase())
    }

    /// Effective pause: any of the three sources.
    pub fn is_paused(&self) -> bool {
        self.paused || self.paused_by_file || self.paused_by_global_file
    }

    pub fn task_type(&self) -> &'static str {
        match self.kind {
            TaskKind::Standalone => "standalone",
            TaskKind::Pipe(_) => "pipe",
        }
    }

    pub fn pipe(&self) -> Option<&PipeSettings> {
        match &self.kind {
            TaskKind::Pipe(pipe) => Some(pipe),
            TaskKind::Standalone => None,
        }
    }

    pub fn pipe_mut(&mut self) -> Option<&mut PipeSettings> {
        match &mut self.kind {
            TaskKind::Pipe(pipe) => Some(pipe),
            TaskKind::Standalone => None,
        }
    }

    /// Scheduler cadence as a duration.
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_period.max(1) * self.schedule_unit.seconds())
    }

    /// Input queue directory for a pipe task.
    pub fn input_dir(&self) -> Option<PathBuf> {
        self.pipe()
            .map(|p| p.base_path.join(format!("{}_working_dir", self.name_snake())))
    }

    /// Quarantine directory for a pipe task.
    pub fn failed_dir(&self) -> Option<PathBuf> {
        self.pipe().map(|p| p.base_path.join(FAILED_WORKING_DIR))
    }

    /// Per-task pause marker path, inside the input directory.
    pub fn pause_file(&self) -> Option<PathBuf> {
        self.input_dir().map(|d| d.join(PAUSE_FILE))
    }

    /// Data subdirectory this stage writes inside a request directory.
    pub fn data_dir_name(&self) -> String {
        format!("{}_data", self.name_snake())
    }

    /// Data subdirectory this stage reads: the previous stage's output,
    /// or its own for the first stage (which has no upstream).
    pub fn input_data_dir_name(&self) -> Option<String> {
        let pipe = self.pipe()?;
        if pipe.is_pipe_first {
            Some(self.data_dir_name())
        } else {
            pipe.previous_task_name
                .as_ref()
                .map(|prev| format!("{}_data", prev.to_lowercase().replace(' ', "_")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_settings(name: &str) -> TaskSettings {
        TaskSettings::new_pipe(
            name,
            "test",
            20,
            5,
            ScheduleUnit::Seconds,
            PathBuf::from("/data"),
        )
    }

    #[test]
    fn slug_and_labels_derive_from_name() {
        let settings = TaskSettings::standalone(
            "Schedule Downloads",
            "test",
            10,
            10,
            ScheduleUnit::Seconds,
        );
        assert_eq!(settings.slug(), "schedule-downloads");
        assert_eq!(settings.name_snake(), "schedule_downloads");
        assert_eq!(settings.status_active(), "schedule downloads in progress");
        assert_eq!(settings.status_complete(), "schedule downloads complete");
    }

    #[test]
    fn effective_pause_is_or_of_three_sources() {
        let mut settings = pipe_settings("Download");
        assert!(!settings.is_paused());
        settings.paused_by_global_file = true;
        assert!(settings.is_paused());
        settings.paused_by_global_file = false;
        settings.paused_by_file = true;
        assert!(settings.is_paused());
        settings.paused_by_file = false;
        settings.paused = true;
        assert!(settings.is_paused());
    }

    #[test]
    fn pipe_directories_derive_from_name() {
        let settings = pipe_settings("Download");
        assert_eq!(
            settings.input_dir().unwrap(),
            PathBuf::from("/data/download_working_dir")
        );
        assert_eq!(
            settings.failed_dir().unwrap(),
            PathBuf::from("/data/failed_working_dir")
        );
        assert_eq!(settings.data_dir_name(), "download_data");
    }

    #[test]
    fn first_stage_reads_its_own_data_dir() {
        let mut settings = pipe_settings("Download");
        settings.pipe_mut().unwrap().is_pipe_first = true;
        assert_eq!(settings.input_data_dir_name().unwrap(), "download_data");

        let mut convert = pipe_settings("Convert");
        convert.pipe_mut().unwrap().previous_task_name = Some("Download".to_string());
        assert_eq!(convert.input_data_dir_name().unwrap(), "download_data");
    }

    #[test]
    fn schedule_interval_spans_units() {
        let seconds =
            TaskSettings::standalone("A", "test", 1, 30, ScheduleUnit::Seconds).schedule_interval();
        assert_eq!(seconds, Duration::from_secs(30));
        let minutes =
            TaskSettings::standalone("B", "test", 1, 15, ScheduleUnit::Minutes).schedule_interval();
        assert_eq!(minutes, Duration::from_secs(900));
        let days =
            TaskSettings::standalone("C", "test", 1, 1, ScheduleUnit::Days).schedule_interval();
        assert_eq!(days, Duration::from_secs(86_400));
    }

    #[test]
    fn standalone_has_no_pipe_paths() {
        let settings = TaskSettings::standalone("Cleaner", "test", 20, 15, ScheduleUnit::Minutes);
        assert!(settings.input_dir().is_none());
        assert!(settings.pause_file().is_none());
        assert_eq!(settings.task_type(), "standalone");
    }
}
