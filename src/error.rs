//! Error types for stepwise backup, restore and download operations.

use std::io;
use thiserror::Error;

/// Machine-readable classification of a [`StepError`].
///
/// Drivers use this to decide whether to call `step` again, surface the
/// failure to a human, or fix their input first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required argument was missing or invalid. Nothing was persisted.
    Validation,
    /// A source, destination or dependency could not be reached right now.
    ResourceUnavailable,
    /// A network fetch failed or returned an unexpected status.
    Transfer,
    /// Unrecoverable data error; the session stays at its last good point.
    Fatal,
    /// The session has no progress record (not started, or already finished).
    NotFound,
}

/// Errors that can occur during stepwise operations.
#[derive(Error, Debug)]
pub enum StepError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error during download.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// SQLite error outside of statement replay.
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    /// Zip archive read/write error.
    #[error(transparent)]
    ZipError(#[from] zip::result::ZipError),

    /// Missing or invalid argument.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// The source (table list, directory, dump log) could not be read.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The directory walk produced no entries to archive.
    #[error("No files found under {0}")]
    NoFilesFound(String),

    /// Neither Content-Range nor Content-Length was present on the size response.
    #[error("Cannot determine remote size of {0}")]
    CannotDetermineSize(String),

    /// The remote answered with a status other than 200/206.
    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// A fetched chunk did not have the requested length.
    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },

    /// A chunk file was missing when merging.
    #[error("Missing chunk file {0}")]
    MissingChunk(String),

    /// The merged file size differs from the reported remote size.
    #[error("Merged file size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The merged file does not match the remote ETag digest.
    #[error("MD5 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A replayed statement failed with a non-duplicate error.
    #[error("Statement on dump line {line} failed: {source}")]
    Statement {
        line: u64,
        statement: String,
        #[source]
        source: rusqlite::Error,
    },

    /// `step` was called without a progress record.
    #[error("No progress record for session {0}")]
    NotStarted(String),
}

impl StepError {
    /// Returns the machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) | StepError::NoFilesFound(_) => ErrorKind::Validation,
            StepError::IoError(_) | StepError::SourceUnavailable(_) => {
                ErrorKind::ResourceUnavailable
            }
            StepError::ReqwestError(_)
            | StepError::HttpStatus { .. }
            | StepError::CannotDetermineSize(_)
            | StepError::ChunkSizeMismatch { .. } => ErrorKind::Transfer,
            StepError::NotStarted(_) => ErrorKind::NotFound,
            StepError::SerdeJsonError(_)
            | StepError::SqliteError(_)
            | StepError::ZipError(_)
            | StepError::MissingChunk(_)
            | StepError::SizeMismatch { .. }
            | StepError::ChecksumMismatch { .. }
            | StepError::Statement { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether calling the same step again may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transfer | ErrorKind::ResourceUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = StepError::HttpStatus {
            url: "http://example.com/a".to_string(),
            status: 503,
        };
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.is_retryable());

        let err = StepError::SizeMismatch {
            expected: 10,
            actual: 9,
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(!err.is_retryable());

        assert_eq!(
            StepError::NoFilesFound("/tmp/x".to_string()).kind(),
            ErrorKind::Validation
        );
    }
}
