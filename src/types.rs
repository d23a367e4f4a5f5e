//! Configuration and status types shared by the stepwise components.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the chunked database dumper.
///
/// # Example
///
/// ```
/// use stepsync::DumpConfig;
///
/// let config = DumpConfig {
///     chunk_size: 500,
///     table_prefix: "wp_".to_string(),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Rows read per `step` call (default: 1,000).
    pub chunk_size: u64,
    /// Table prefix of the source database, recorded in the dump header and
    /// used to qualify excluded table names.
    pub table_prefix: String,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            table_prefix: String::new(),
        }
    }
}

/// Configuration for the chunked database restorer.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Dump lines replayed per `step` call (default: 1,000).
    pub line_budget: u64,
    /// Table prefix of the destination database.
    pub table_prefix: String,
    /// Unprefixed name of the options table whose inserts become upserts.
    pub options_table: String,
    /// Tables whose statements are skipped. Names may be given with or
    /// without the destination prefix.
    pub exclude_tables: Vec<String>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            line_budget: 1_000,
            table_prefix: String::new(),
            options_table: "options".to_string(),
            exclude_tables: Vec::new(),
        }
    }
}

/// Configuration for the multi-part archive builder.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Entries processed per `step` call (default: 100).
    pub chunk_size: usize,
    /// Maximum uncompressed bytes per part before a new part is opened
    /// (default: 2 GiB).
    pub max_part_size: u64,
    /// Store entries without compression.
    pub store_only: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_part_size: 2 * 1024 * 1024 * 1024,
            store_only: false,
        }
    }
}

/// Configuration for the batched archive extractor.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Entries handled per `step` call (default: 100).
    pub batch_size: usize,
    /// Replace files that already exist at the destination.
    pub overwrite_existing: bool,
    /// When non-empty, only entries whose first path segment is listed are
    /// extracted.
    pub include: Vec<String>,
    /// Entries whose first path segment is listed are skipped.
    pub exclude: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            overwrite_existing: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Configuration for the resumable remote downloader.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Bytes requested per `process_step` call (default: 5 MiB).
    pub chunk_size: u64,
    /// Per-request timeout, keeps one step inside the caller's window
    /// (default: 30s).
    pub request_timeout: Duration,
    /// Verify the merged file against the size request's ETag when it is a plain
    /// MD5 digest (default: true).
    pub verify_checksum: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            verify_checksum: true,
        }
    }
}

/// Result of one `start`/`step` call, suitable for progress reporting.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StepStatus {
    /// True once the session has nothing left to do.
    pub done: bool,
    /// Completion percentage in `0.0..=100.0`.
    pub percent: f64,
    /// Units (rows, bytes, entries) completed so far.
    pub done_units: u64,
    /// Units known to exist in total, 0 if unknown.
    pub total_units: u64,
    /// Cumulative entries handled successfully.
    pub processed: u64,
    /// Cumulative entries skipped (filtered, already present, not overwritten).
    pub skipped: u64,
    /// Cumulative per-entry failures.
    pub error_count: u64,
    /// Per-entry failures from this call only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Archive part files produced so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<PathBuf>,
}
