//! Durable per-session progress records.
//!
//! A [`ProgressRecord`] is the only state that survives between two `step`
//! calls. It is stored as a small JSON document and always replaced as a
//! whole file (write to a sibling temp file, then rename), so an interrupted
//! save leaves either the old or the new record on disk.
//!
//! The store does no locking. At most one `step` per session may be in
//! flight; enforcing that is the caller's job.

use crate::error::StepError;
use crate::types::StepStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Cursor plus counters for one session.
///
/// The cursor type differs per component (table/row, file index, byte
/// offset); the counters and the `done` flag are common.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord<C> {
    /// Component-specific resume position.
    pub cursor: C,
    /// Total units of work, 0 until known.
    pub total_units: u64,
    /// Units completed. Never decreases.
    pub done_units: u64,
    /// One-way completion flag.
    pub done: bool,
    /// RFC 3339 timestamp of the last save.
    pub last_updated: String,
}

impl<C> ProgressRecord<C> {
    /// Creates a fresh, not-done record.
    pub fn new(cursor: C, total_units: u64) -> Self {
        Self {
            cursor,
            total_units,
            done_units: 0,
            done: false,
            last_updated: now_rfc3339(),
        }
    }

    /// Moves the cursor forward and raises `done_units`.
    ///
    /// `done_units` is clamped so it never decreases and never exceeds a
    /// known `total_units`.
    pub fn advance(&mut self, cursor: C, done_units: u64) {
        self.cursor = cursor;
        let mut units = done_units.max(self.done_units);
        if self.total_units > 0 {
            units = units.min(self.total_units);
        }
        self.done_units = units;
    }

    /// Marks the record as done. There is no way back.
    pub fn mark_done(&mut self) {
        self.done = true;
        if self.total_units > 0 {
            self.done_units = self.total_units;
        }
    }

    /// Completion percentage in `0.0..=100.0`.
    pub fn percent(&self) -> f64 {
        if self.done {
            return 100.0;
        }
        if self.total_units == 0 {
            return 0.0;
        }
        (self.done_units as f64 / self.total_units as f64 * 100.0).min(100.0)
    }

    /// Builds the common part of a step report.
    pub fn status(&self) -> StepStatus {
        StepStatus {
            done: self.done,
            percent: self.percent(),
            done_units: self.done_units,
            total_units: self.total_units,
            ..StepStatus::default()
        }
    }
}

/// Loads and saves one session's [`ProgressRecord`].
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    /// Creates a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing JSON document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record. `Ok(None)` means the session has not started yet.
    pub fn load<C: DeserializeOwned>(&self) -> Result<Option<ProgressRecord<C>>, StepError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the record on disk, refreshing `last_updated`.
    pub fn save<C: Serialize>(&self, record: &mut ProgressRecord<C>) -> Result<(), StepError> {
        record.last_updated = now_rfc3339();
        write_json_atomic(&self.path, record)?;
        debug!(
            "Saved progress {}/{} (done={}) to {}",
            record.done_units,
            record.total_units,
            record.done,
            self.path.display()
        );
        Ok(())
    }

    /// Removes the record. Missing records are not an error.
    pub fn delete(&self) -> Result<(), StepError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serializes `value` next to `path` and renames it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StepError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}
