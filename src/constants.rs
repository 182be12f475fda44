//! # Status Vocabulary and Priorities
//!
//! Core constants shared between the scheduler, the pipeline tasks, and the
//! job state store. Status values are free-form strings: they are stored
//! title-cased and compared case-insensitively, so every comparison in the
//! crate goes through the helpers here.

use serde::{Deserialize, Serialize};

/// Job request has been created but no stage has picked it up yet.
pub const STATUS_PENDING: &str = "pending";
/// A stage raised an error; the request directory is in quarantine.
pub const STATUS_FAILED: &str = "failed";
/// An operator cancelled the request through the resource layer.
pub const STATUS_CANCELLED: &str = "cancelled";

/// Marker file name that pauses a task (per-task in its input directory,
/// global in the configured pause location).
pub const PAUSE_FILE: &str = "PAUSE";

/// Marker file inside a request directory holding the request id.
pub const REQUEST_ID_FILE: &str = "request_id.txt";

/// Terminal success directory for request directories that finished the
/// last pipeline stage.
pub const DONE_WORKING_DIR: &str = "done_working_dir";
/// Quarantine directory for request directories whose stage failed.
pub const FAILED_WORKING_DIR: &str = "failed_working_dir";

/// Scheduling priority of a queued request. Encoded as a single numeric
/// character prefix in request directory names; lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Single-character prefix used in request directory names.
    pub fn prefix(self) -> &'static str {
        match self {
            Priority::High => "0",
            Priority::Medium => "5",
            Priority::Low => "9",
        }
    }

    /// Parse a priority name. Unknown values default to `High` so that
    /// freshly scheduled work is never starved by a bad label.
    pub fn parse(value: &str) -> Priority {
        match value.to_ascii_lowercase().as_str() {
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => Priority::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Title-case a status for storage: `"download in progress"` becomes
/// `"Download In Progress"`.
pub fn title_case(status: &str) -> String {
    status
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive status comparison, the only valid way to compare
/// status values in this crate.
pub fn status_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// True if `status` matches any entry of `set`, case-insensitively.
pub fn status_in(status: &str, set: &[String]) -> bool {
    set.iter().any(|s| status_eq(status, s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_prefixes_sort_high_first() {
        assert!(Priority::High.prefix() < Priority::Medium.prefix());
        assert!(Priority::Medium.prefix() < Priority::Low.prefix());
    }

    #[test]
    fn unknown_priority_defaults_to_high() {
        assert_eq!(Priority::parse("urgent"), Priority::High);
        assert_eq!(Priority::parse("LOW"), Priority::Low);
        assert_eq!(Priority::parse("Medium"), Priority::Medium);
    }

    #[test]
    fn title_case_status() {
        assert_eq!(title_case("download in progress"), "Download In Progress");
        assert_eq!(title_case("pending"), "Pending");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn status_comparison_is_case_insensitive() {
        assert!(status_eq("Download Complete", "download complete"));
        assert!(status_in(
            "FAILED",
            &["failed".to_string(), "cancelled".to_string()]
        ));
    }
}
