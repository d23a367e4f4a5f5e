//! StepSync - Resumable, stepwise backup and restore engine
//!
//! Every long-running job in this crate is split into small, bounded steps.
//! A step does a fixed amount of work, persists a cursor, and returns a
//! [`StepStatus`]. Killing the process between (or during) steps loses at
//! most the step in flight; calling `step` again picks up from the last
//! saved cursor.
//!
//! # Features
//!
//! - **Chunked DB Dump**: SQLite tables to a line-oriented statement log
//! - **Chunked DB Restore**: Replay a dump with prefix rewriting and upserts
//! - **Multi-part Zip**: Archive a directory into size-capped zip parts
//! - **Chunked Extraction**: Unpack a zip archive a batch of entries at a time
//! - **Resumable Downloads**: HTTP byte-range downloads with MD5 verification
//!
//! # Example
//!
//! ```no_run
//! use stepsync::{Dumper, DumpConfig, Session};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = rusqlite::Connection::open("site.db")?;
//! let session = Session::new(".stepsync", "nightly", "site.db", "backups")?;
//! let dumper = Dumper::new(session, &conn, DumpConfig::default());
//!
//! dumper.start(&[])?;
//! while !dumper.step()?.done {}
//! dumper.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod download;
pub mod dump;
pub mod error;
pub mod extract;
pub mod progress;
pub mod restore;
pub mod session;
pub mod types;

mod merge;
mod sql;
mod verify;

pub use archive::{part_path, ArchiveBuilder, ArchiveCursor};
pub use download::{DownloadCursor, DownloadStatus, Downloader, HttpRangeSource, SizeResponse, RangeSource};
pub use dump::{DumpCursor, DumpEntry, Dumper, EntryType, DUMP_FILE_NAME};
pub use error::{ErrorKind, StepError};
pub use extract::{ExtractCursor, Extractor};
pub use progress::{ProgressRecord, ProgressStore};
pub use restore::{RestoreCursor, Restorer};
pub use session::{Session, SessionStatus};
pub use types::{
    ArchiveConfig, DownloadConfig, DumpConfig, ExtractConfig, RestoreConfig, StepStatus,
};
