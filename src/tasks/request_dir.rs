//! # Request Directory Queue
//!
//! Filesystem convention for handing a unit of work between pipeline
//! stages. A request directory's name encodes priority, creation time, and
//! request id — `<priority><sep><timestamp><sep><request_id>` — so that a
//! plain lexicographic sort of sibling directories yields priority-then-age
//! order. Moving the whole directory into the next stage's queue is the
//! only synchronization point between stages.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::constants::{Priority, REQUEST_ID_FILE};
use crate::error::{EngineError, Result};

/// Parsed request directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDirName {
    pub priority: Priority,
    /// Unix time in 100 ns units; fixed-width for contemporary dates, so
    /// the string sort is also a time sort.
    pub timestamp: i64,
    pub request_id: String,
}

impl RequestDirName {
    /// Name a new directory for `request_id` queued now.
    pub fn new(priority: Priority, request_id: impl Into<String>) -> Self {
        Self {
            priority,
            timestamp: timestamp_token(),
            request_id: request_id.into(),
        }
    }

    pub fn format(&self, separator: char) -> String {
        format!(
            "{}{separator}{}{separator}{}",
            self.priority.prefix(),
            self.timestamp,
            self.request_id
        )
    }

    /// Parse a directory name. Returns `None` for names that do not follow
    /// the convention (foreign files are simply not queue entries).
    pub fn parse(name: &str, separator: char) -> Option<Self> {
        let mut parts = name.splitn(3, separator);
        let prefix = parts.next()?;
        let timestamp = parts.next()?.parse::<i64>().ok()?;
        let request_id = parts.next()?;
        let priority = match prefix {
            "0" => Priority::High,
            "5" => Priority::Medium,
            "9" => Priority::Low,
            _ => return None,
        };
        Some(Self {
            priority,
            timestamp,
            request_id: request_id.to_string(),
        })
    }
}

/// Current time token for directory and result file names.
pub fn timestamp_token() -> i64 {
    Utc::now().timestamp_micros() * 10
}

/// The next request directory to process: first subdirectory in
/// lexicographic order, i.e. highest priority then oldest.
pub fn next_request_dir(input_dir: &Path) -> Result<Option<PathBuf>> {
    if !input_dir.is_dir() {
        return Ok(None);
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(input_dir)
        .map_err(|e| EngineError::io(format!("listing {}", input_dir.display()), e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs.into_iter().next())
}

/// Create a fresh request directory in `input_dir`, removing any stale
/// directory left by a prior attempt for the same request id, and write
/// the request id marker file.
pub fn create_request_dir(
    input_dir: &Path,
    request_id: &str,
    priority: Priority,
    separator: char,
) -> Result<PathBuf> {
    delete_request_dirs(input_dir, request_id)?;

    let name = RequestDirName::new(priority, request_id).format(separator);
    let request_dir = input_dir.join(name);
    fs::create_dir_all(&request_dir)
        .map_err(|e| EngineError::io(format!("creating {}", request_dir.display()), e))?;
    write_request_id(&request_dir, request_id)?;

    debug!(request_id, dir = %request_dir.display(), "request directory created");
    Ok(request_dir)
}

/// Remove directories from previous executions of the same request.
pub fn delete_request_dirs(input_dir: &Path, request_id: &str) -> Result<()> {
    if !input_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(input_dir)
        .map_err(|e| EngineError::io(format!("listing {}", input_dir.display()), e))?
        .flatten()
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() && name.contains(request_id) {
            fs::remove_dir_all(&path)
                .map_err(|e| EngineError::io(format!("removing {}", path.display()), e))?;
            info!(request_id, dir = %path.display(), "stale request directory removed");
        }
    }
    Ok(())
}

/// Read the request id marker file.
pub fn read_request_id(request_dir: &Path) -> Result<String> {
    let path = request_dir.join(REQUEST_ID_FILE);
    let id = fs::read_to_string(&path)
        .map_err(|e| EngineError::io(format!("reading {}", path.display()), e))?;
    Ok(id.trim().to_string())
}

/// Write the request id marker file.
pub fn write_request_id(request_dir: &Path, request_id: &str) -> Result<()> {
    let path = request_dir.join(REQUEST_ID_FILE);
    fs::write(&path, request_id)
        .map_err(|e| EngineError::io(format!("writing {}", path.display()), e))
}

/// Remove the directory if it exists, then create it empty, so partial
/// output from a prior attempt cannot leak into this one.
pub fn fresh_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        fs::remove_dir_all(dir)
            .map_err(|e| EngineError::io(format!("removing {}", dir.display()), e))?;
    }
    fs::create_dir_all(dir).map_err(|e| EngineError::io(format!("creating {}", dir.display()), e))
}

/// Move a request directory wholesale under `dest_parent`, keeping its
/// name. Idempotent: if the source is gone and the destination already
/// holds the directory, this is a no-op.
pub fn move_request_dir(request_dir: &Path, dest_parent: &Path) -> Result<PathBuf> {
    let name = request_dir
        .file_name()
        .ok_or_else(|| {
            EngineError::io(
                format!("moving {}", request_dir.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no directory name"),
            )
        })?
        .to_owned();
    let dest = dest_parent.join(&name);

    if !request_dir.exists() {
        if dest.exists() {
            // already moved by a prior attempt
            return Ok(dest);
        }
        return Err(EngineError::io(
            format!("moving {}", request_dir.display()),
            std::io::Error::new(std::io::ErrorKind::NotFound, "source directory missing"),
        ));
    }

    fs::create_dir_all(dest_parent)
        .map_err(|e| EngineError::io(format!("creating {}", dest_parent.display()), e))?;
    if dest.exists() {
        // leftover from an interrupted move; the source is authoritative
        fs::remove_dir_all(&dest)
            .map_err(|e| EngineError::io(format!("removing {}", dest.display()), e))?;
    }
    fs::rename(request_dir, &dest).map_err(|e| {
        EngineError::io(
            format!("moving {} to {}", request_dir.display(), dest.display()),
            e,
        )
    })?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn name_round_trip() {
        let name = RequestDirName::new(Priority::Medium, "abc-123");
        let formatted = name.format('#');
        let parsed = RequestDirName::parse(&formatted, '#').unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn malformed_names_rejected() {
        assert!(RequestDirName::parse("stray-file", '#').is_none());
        assert!(RequestDirName::parse("7#123#abc", '#').is_none());
        assert!(RequestDirName::parse("0#not-a-number#abc", '#').is_none());
    }

    #[test]
    fn high_priority_sorts_before_low_regardless_of_age() {
        let old_low = RequestDirName {
            priority: Priority::Low,
            timestamp: 10_000_000_000_000_000,
            request_id: "old".to_string(),
        };
        let new_high = RequestDirName {
            priority: Priority::High,
            timestamp: 20_000_000_000_000_000,
            request_id: "new".to_string(),
        };
        assert!(new_high.format('#') < old_low.format('#'));
    }

    #[test]
    fn next_request_dir_picks_priority_then_fifo() {
        let queue = tempfile::tempdir().unwrap();
        for name in ["9#300#c", "0#200#b", "0#100#a"] {
            std::fs::create_dir(queue.path().join(name)).unwrap();
        }
        // a file must never be selected
        std::fs::write(queue.path().join("0#000#file"), b"x").unwrap();

        let next = next_request_dir(queue.path()).unwrap().unwrap();
        assert_eq!(next.file_name().unwrap().to_str().unwrap(), "0#100#a");
    }

    #[test]
    fn create_request_dir_cleans_stale_attempts() {
        let queue = tempfile::tempdir().unwrap();
        let stale = queue.path().join("9#1#req-1");
        std::fs::create_dir(&stale).unwrap();

        let fresh = create_request_dir(queue.path(), "req-1", Priority::High, '#').unwrap();
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert_eq!(read_request_id(&fresh).unwrap(), "req-1");
    }

    #[test]
    fn fresh_dir_discards_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("convert_data");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("partial.json"), b"{}").unwrap();

        fresh_dir(&out).unwrap();
        assert!(out.exists());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn move_request_dir_is_idempotent() {
        let src_parent = tempfile::tempdir().unwrap();
        let dest_parent = tempfile::tempdir().unwrap();
        let request_dir = src_parent.path().join("0#1#req-1");
        std::fs::create_dir(&request_dir).unwrap();
        std::fs::write(request_dir.join("data.json"), b"{}").unwrap();

        let moved = move_request_dir(&request_dir, dest_parent.path()).unwrap();
        assert!(moved.join("data.json").exists());
        assert!(!request_dir.exists());

        // second move of the now-missing source is a no-op
        let again = move_request_dir(&request_dir, dest_parent.path()).unwrap();
        assert_eq!(again, moved);
    }

    proptest! {
        /// Lexicographic order of formatted names equals (priority, age)
        /// order for contemporary timestamps (equal digit width).
        #[test]
        fn lexicographic_order_is_priority_then_age(
            ts_a in 10_000_000_000_000_000i64..99_999_999_999_999_999i64,
            ts_b in 10_000_000_000_000_000i64..99_999_999_999_999_999i64,
            pa in 0usize..3,
            pb in 0usize..3,
        ) {
            let priorities = [Priority::High, Priority::Medium, Priority::Low];
            let a = RequestDirName { priority: priorities[pa], timestamp: ts_a, request_id: "x".into() };
            let b = RequestDirName { priority: priorities[pb], timestamp: ts_b, request_id: "x".into() };
            let name_order = a.format('#').cmp(&b.format('#'));
            let key_order = (priorities[pa].prefix(), ts_a).cmp(&(priorities[pb].prefix(), ts_b));
            prop_assert_eq!(name_order, key_order);
        }
    }
}
