//! Chunked database restorer.
//!
//! Replays a dump log written by [`crate::dump::Dumper`] into a (possibly
//! different) SQLite database. Each [`Restorer::step`] reads up to
//! `line_budget` lines from the saved byte offset and runs every statement
//! from those lines in one transaction:
//!
//! - table names are moved from the recorded prefix to the destination's,
//! - inserts into the options table become `INSERT OR REPLACE`,
//! - statements touching an excluded table are skipped,
//! - "already exists" / duplicate-key failures are logged and ignored.
//!
//! Any other failure rolls the transaction back and leaves the saved offset
//! where it was, so the next call retries the same lines.

use crate::dump::{DumpEntry, EntryType};
use crate::error::StepError;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::session::Session;
use crate::sql::{insert_target, is_duplicate_error, rewrite_prefix, statement_target, to_upsert};
use crate::types::{RestoreConfig, StepStatus};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Resume position of a restore.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestoreCursor {
    pub byte_offset: u64,
    pub line_number: u64,
    /// Prefix recorded in the dump header, once seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_prefix: Option<String>,
    /// Header statements, re-applied on every new connection.
    #[serde(default)]
    pub session_statements: Vec<String>,
    pub statements_run: u64,
    pub statements_skipped: u64,
    pub duplicates_ignored: u64,
}

/// Replays a dump log into a database.
pub struct Restorer<'c> {
    session: Session,
    conn: &'c mut Connection,
    config: RestoreConfig,
    store: ProgressStore,
}

impl<'c> Restorer<'c> {
    /// `session.source` is the path of the dump log.
    pub fn new(session: Session, conn: &'c mut Connection, config: RestoreConfig) -> Self {
        let store = session.progress_store();
        Self {
            session,
            conn,
            config,
            store,
        }
    }

    fn dump_path(&self) -> PathBuf {
        PathBuf::from(&self.session.source)
    }

    /// Initializes the cursor at the start of the dump log.
    ///
    /// A leading `header` entry is consumed here: its statements are run on
    /// the bare connection and kept in the cursor, because SQLite ignores
    /// `PRAGMA foreign_keys` inside a transaction.
    pub fn start(&self) -> Result<StepStatus, StepError> {
        if self.session.source.is_empty() {
            return Err(StepError::Validation("dump log path is required".to_string()));
        }
        if self.config.line_budget == 0 {
            return Err(StepError::Validation("line budget must be positive".to_string()));
        }
        let size = fs::metadata(self.dump_path())
            .map_err(|e| {
                StepError::SourceUnavailable(format!(
                    "cannot read dump log {}: {}",
                    self.dump_path().display(),
                    e
                ))
            })?
            .len();

        self.session.log(&format!(
            "===== restore started from {} ({} bytes) =====",
            self.dump_path().display(),
            size
        ))?;
        info!(
            "🔄 Restoring {} ({} bytes) into prefix {:?}",
            self.dump_path().display(),
            size,
            self.config.table_prefix
        );

        let mut cursor = RestoreCursor::default();
        if let Some((header, read)) = self.read_header()? {
            self.apply_session_statements(&header.statements, 1)?;
            cursor.byte_offset = read;
            cursor.line_number = 1;
            cursor.source_prefix = header.prefix;
            cursor.session_statements = header.statements;
        }

        let mut record = ProgressRecord::new(cursor, size);
        record.done_units = record.cursor.byte_offset;
        if record.cursor.byte_offset >= size {
            record.mark_done();
        }
        self.store.save(&mut record)?;
        Ok(record.status())
    }

    /// The first line of the log if it is a complete `header` entry, with
    /// its length in bytes.
    fn read_header(&self) -> Result<Option<(DumpEntry, u64)>, StepError> {
        let mut reader = BufReader::new(File::open(self.dump_path())?);
        let mut buf = Vec::new();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 || !buf.ends_with(b"\n") {
            return Ok(None);
        }
        match serde_json::from_slice::<DumpEntry>(&buf) {
            Ok(entry) if entry.entry_type == EntryType::Header => Ok(Some((entry, read as u64))),
            _ => Ok(None),
        }
    }

    /// Runs header statements outside of any transaction.
    fn apply_session_statements(&self, statements: &[String], line: u64) -> Result<(), StepError> {
        for statement in statements {
            self.conn
                .execute_batch(statement)
                .map_err(|source| StepError::Statement {
                    line,
                    statement: statement.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Replays the next batch of lines.
    pub fn step(&mut self) -> Result<StepStatus, StepError> {
        let mut record: ProgressRecord<RestoreCursor> = self
            .store
            .load()?
            .ok_or_else(|| StepError::NotStarted(self.session.id.clone()))?;
        if record.done {
            return Ok(record.status());
        }

        let mut cursor = record.cursor.clone();
        let mut file = File::open(self.dump_path())?;
        file.seek(SeekFrom::Start(cursor.byte_offset))?;
        let mut reader = BufReader::new(file);

        self.apply_session_statements(&cursor.session_statements, cursor.line_number)?;

        let tx = self.conn.transaction()?;
        let mut eof = false;
        let mut lines = 0u64;
        let mut buf = Vec::new();

        while lines < self.config.line_budget {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                eof = true;
                break;
            }
            let complete = buf.ends_with(b"\n");
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();

            if !line.is_empty() {
                let entry: DumpEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    Err(e) if !complete => {
                        warn!(
                            "Ignoring truncated dump tail at line {}: {}",
                            cursor.line_number + 1,
                            e
                        );
                        eof = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };

                if entry.entry_type == EntryType::Header {
                    // Header statements only take effect outside a
                    // transaction; they run before the next step's batch.
                    if let Some(prefix) = entry.prefix.clone() {
                        cursor.source_prefix = Some(prefix);
                    }
                    cursor.session_statements = entry.statements;
                    debug!(
                        "Header at line {} deferred to the next step",
                        cursor.line_number + 1
                    );
                    cursor.byte_offset += read as u64;
                    cursor.line_number += 1;
                    if !complete {
                        eof = true;
                    }
                    // Leave the batch so the new statements apply first.
                    break;
                }

                for raw in &entry.statements {
                    let Some(statement) = prepare_statement(&self.config, raw, &cursor) else {
                        cursor.statements_skipped += 1;
                        continue;
                    };
                    match tx.execute_batch(&statement) {
                        Ok(()) => cursor.statements_run += 1,
                        Err(e) if is_duplicate_error(&e) => {
                            warn!(
                                "Line {}: ignoring already-applied statement: {}",
                                cursor.line_number + 1,
                                e
                            );
                            cursor.duplicates_ignored += 1;
                        }
                        Err(e) => {
                            // Dropping `tx` rolls the whole batch back.
                            return Err(StepError::Statement {
                                line: cursor.line_number + 1,
                                statement,
                                source: e,
                            });
                        }
                    }
                }
            }

            cursor.byte_offset += read as u64;
            cursor.line_number += 1;
            lines += 1;
            if !complete {
                eof = true;
                break;
            }
        }

        if !eof && reader.fill_buf()?.is_empty() {
            eof = true;
        }

        tx.commit()?;
        debug!(
            "Restored lines up to {} (offset {})",
            cursor.line_number, cursor.byte_offset
        );

        let offset = cursor.byte_offset;
        record.advance(cursor, offset);
        if eof {
            record.mark_done();
            info!("✅ Restore complete after {} line(s)", record.cursor.line_number);
        }
        self.store.save(&mut record)?;
        Ok(record.status())
    }

    /// Deletes the progress record and writes a completion marker.
    pub fn finish(&self) -> Result<(), StepError> {
        let record: Option<ProgressRecord<RestoreCursor>> = self.store.load()?;
        let summary = match record {
            Some(r) => format!(
                "{} line(s), {} statement(s) run, {} skipped, {} duplicate(s) ignored",
                r.cursor.line_number,
                r.cursor.statements_run,
                r.cursor.statements_skipped,
                r.cursor.duplicates_ignored
            ),
            None => "no progress record".to_string(),
        };
        self.store.delete()?;
        self.session
            .log(&format!("===== restore completed: {} =====", summary))?;
        Ok(())
    }
}

/// Applies prefix rewriting, exclusion and the options upsert.
/// `None` means the statement is skipped.
///
/// A statement is excluded when the table it writes to or defines is
/// excluded; mentions in column lists or foreign keys do not count.
fn prepare_statement(
    config: &RestoreConfig,
    raw: &str,
    cursor: &RestoreCursor,
) -> Option<String> {
    let dest_prefix = &config.table_prefix;
    let statement = match &cursor.source_prefix {
        Some(from) => rewrite_prefix(raw, from, dest_prefix),
        None => raw.to_string(),
    };

    if !config.exclude_tables.is_empty() {
        let excluded: Vec<String> = config
            .exclude_tables
            .iter()
            .map(|t| qualify(dest_prefix, t))
            .collect();
        if statement_target(&statement).is_some_and(|target| excluded.contains(&target)) {
            debug!("Skipping statement on excluded table: {}", statement);
            return None;
        }
    }

    let options = qualify(dest_prefix, &config.options_table);
    match insert_target(&statement) {
        Some(target) if target == options => Some(to_upsert(&statement)),
        _ => Some(statement),
    }
}

fn qualify(prefix: &str, table: &str) -> String {
    if table.starts_with(prefix) {
        table.to_string()
    } else {
        format!("{}{}", prefix, table)
    }
}
