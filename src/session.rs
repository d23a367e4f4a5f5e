//! Session descriptors and their working directories.

use crate::error::StepError;
use crate::progress::{now_rfc3339, write_json_atomic, ProgressStore};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const SESSION_FILE: &str = "session.json";
const PROGRESS_FILE: &str = "progress.json";
const LOG_FILE: &str = "session.log";

/// Lifecycle state of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One backup, restore or download job.
///
/// Every session owns `<root>/<id>/`, which holds its descriptor, progress
/// record, human-readable log and any scratch files (e.g. download chunks).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Session {
    /// Opaque, filesystem-safe identifier.
    pub id: String,
    /// Database path, directory, dump log, archive or URL, depending on the job.
    pub source: String,
    /// Output directory, archive path or final file path.
    pub destination: String,
    pub status: SessionStatus,
    pub created_at: String,
    #[serde(skip)]
    root: PathBuf,
}

impl Session {
    /// Creates a pending session rooted under `root`.
    ///
    /// Fails with a validation error when the id is empty or contains
    /// anything other than ASCII letters, digits, `-` and `_`.
    pub fn new(
        root: impl Into<PathBuf>,
        id: &str,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Result<Self, StepError> {
        validate_id(id)?;
        Ok(Self {
            id: id.to_string(),
            source: source.into(),
            destination: destination.into(),
            status: SessionStatus::Pending,
            created_at: now_rfc3339(),
            root: root.into(),
        })
    }

    /// Loads a previously saved descriptor, `Ok(None)` if there is none.
    pub fn open(root: impl Into<PathBuf>, id: &str) -> Result<Option<Self>, StepError> {
        validate_id(id)?;
        let root = root.into();
        let path = root.join(id).join(SESSION_FILE);
        match fs::read(&path) {
            Ok(bytes) => {
                let mut session: Session = serde_json::from_slice(&bytes)?;
                session.root = root;
                Ok(Some(session))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Working directory exclusively owned by this session.
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(&self.id)
    }

    /// Progress store colocated with the working directory.
    pub fn progress_store(&self) -> ProgressStore {
        ProgressStore::new(self.work_dir().join(PROGRESS_FILE))
    }

    /// Path of the human-readable session log.
    pub fn log_path(&self) -> PathBuf {
        self.work_dir().join(LOG_FILE)
    }

    /// Persists the descriptor.
    pub fn save(&self) -> Result<(), StepError> {
        write_json_atomic(&self.work_dir().join(SESSION_FILE), self)
    }

    /// Updates the status and persists the descriptor.
    pub fn set_status(&mut self, status: SessionStatus) -> Result<(), StepError> {
        if self.status != status {
            info!("Session {}: {:?} -> {:?}", self.id, self.status, status);
            self.status = status;
        }
        self.save()
    }

    /// Appends a timestamped line to the session log.
    pub fn log(&self, message: &str) -> Result<(), StepError> {
        fs::create_dir_all(self.work_dir())?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(file, "[{}] {}", now_rfc3339(), message)?;
        Ok(())
    }

    /// Removes the working directory and everything in it.
    pub fn cleanup(&self) -> Result<(), StepError> {
        remove_dir_if_exists(&self.work_dir())?;
        info!("🧹 Removed working directory of session {}", self.id);
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), StepError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StepError::Validation(format!(
            "session id {:?} must be non-empty and contain only letters, digits, '-' or '_'",
            id
        )))
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<(), StepError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_unsafe_ids() {
        let dir = TempDir::new().unwrap();
        for id in ["", "../escape", "a/b", "with space"] {
            let err = Session::new(dir.path(), id, "src", "dst").unwrap_err();
            assert!(matches!(err, StepError::Validation(_)), "id {:?}", id);
        }
        assert!(Session::new(dir.path(), "job-01_a", "src", "dst").is_ok());
    }

    #[test]
    fn test_save_open_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::new(dir.path(), "s1", "db.sqlite", "out").unwrap();
        session.set_status(SessionStatus::Running).unwrap();
        session.log("hello").unwrap();

        let reopened = Session::open(dir.path(), "s1").unwrap().unwrap();
        assert_eq!(reopened.status, SessionStatus::Running);
        assert_eq!(reopened.source, "db.sqlite");
        assert_eq!(reopened.work_dir(), dir.path().join("s1"));

        let log = fs::read_to_string(session.log_path()).unwrap();
        assert!(log.trim_end().ends_with("hello"));

        session.cleanup().unwrap();
        assert!(!session.work_dir().exists());
        assert!(Session::open(dir.path(), "s1").unwrap().is_none());
    }
}
