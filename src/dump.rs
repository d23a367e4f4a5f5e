//! Chunked database dumper.
//!
//! Writes a replayable, append-only JSON-lines log (`backup.sql.jsonl`) of a
//! SQLite database, one bounded chunk of rows per [`Dumper::step`] call.

use crate::error::StepError;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::session::Session;
use crate::sql::{literal, quote_ident};
use crate::types::{DumpConfig, StepStatus};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info};

/// File name of the dump log inside the destination directory.
pub const DUMP_FILE_NAME: &str = "backup.sql.jsonl";

/// Kind of a dump log line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Header,
    TableSchema,
    Row,
}

/// One line of the dump log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DumpEntry {
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Table the statements belong to (schema and row entries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Table prefix of the source database (header entries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub statements: Vec<String>,
}

/// Resume position of a dump.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DumpCursor {
    pub table_index: usize,
    pub row_offset: u64,
    /// Tables to dump, fixed at start.
    pub tables: Vec<String>,
    /// Length of the dump log after the last saved step. Anything past it
    /// was written by an interrupted step and is cut off on resume.
    pub log_bytes: u64,
}

/// Dumps a database into a resumable log.
pub struct Dumper<'c> {
    session: Session,
    conn: &'c Connection,
    config: DumpConfig,
    store: ProgressStore,
}

impl<'c> Dumper<'c> {
    /// `session.destination` is the directory receiving the dump log.
    pub fn new(session: Session, conn: &'c Connection, config: DumpConfig) -> Self {
        let store = session.progress_store();
        Self {
            session,
            conn,
            config,
            store,
        }
    }

    /// Path of the dump log artifact.
    pub fn dump_path(&self) -> PathBuf {
        PathBuf::from(&self.session.destination).join(DUMP_FILE_NAME)
    }

    /// Enumerates tables, truncates the log and writes the header entry.
    ///
    /// Excluded names are qualified with the configured prefix before
    /// matching; already-qualified names match as given.
    pub fn start(&self, exclude_tables: &[String]) -> Result<StepStatus, StepError> {
        if self.session.destination.is_empty() {
            return Err(StepError::Validation(
                "dump destination directory is required".to_string(),
            ));
        }
        if self.config.chunk_size == 0 {
            return Err(StepError::Validation("chunk size must be positive".to_string()));
        }

        let prefix = &self.config.table_prefix;
        let excluded: Vec<String> = exclude_tables
            .iter()
            .map(|name| {
                if name.starts_with(prefix.as_str()) {
                    name.clone()
                } else {
                    format!("{}{}", prefix, name)
                }
            })
            .collect();

        let tables: Vec<String> = list_tables(self.conn)
            .map_err(|e| StepError::SourceUnavailable(format!("cannot list tables: {}", e)))?
            .into_iter()
            .filter(|t| !excluded.contains(t))
            .collect();

        let mut total_rows = 0u64;
        for table in &tables {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )?;
            total_rows += count as u64;
        }

        fs::create_dir_all(&self.session.destination)?;
        let mut log = BufWriter::new(File::create(self.dump_path())?);
        write_entry(
            &mut log,
            &DumpEntry {
                entry_type: EntryType::Header,
                table: None,
                prefix: Some(prefix.clone()),
                statements: header_statements(),
            },
        )?;
        log.flush()?;
        let log_bytes = log.get_ref().metadata()?.len();

        info!(
            "📦 Dumping {} table(s), {} row(s) to {}",
            tables.len(),
            total_rows,
            self.dump_path().display()
        );
        self.session.log(&format!(
            "dump started: {} table(s), {} excluded",
            tables.len(),
            excluded.len()
        ))?;

        let cursor = DumpCursor {
            table_index: 0,
            row_offset: 0,
            tables,
            log_bytes,
        };
        let mut record = ProgressRecord::new(cursor, total_rows);
        if record.cursor.tables.is_empty() {
            record.mark_done();
        }
        self.store.save(&mut record)?;
        Ok(record.status())
    }

    /// Dumps one chunk of rows of the current table.
    ///
    /// A table's schema entry is written before its first chunk. The cursor
    /// moves to the next table as soon as a chunk reaches the end of the
    /// current one, so a table of exactly `chunk_size` rows takes one step.
    pub fn step(&self) -> Result<StepStatus, StepError> {
        let mut record: ProgressRecord<DumpCursor> = self
            .store
            .load()?
            .ok_or_else(|| StepError::NotStarted(self.session.id.clone()))?;
        if record.done {
            return Ok(record.status());
        }

        let mut cursor = record.cursor.clone();
        let Some(table) = cursor.tables.get(cursor.table_index).cloned() else {
            record.mark_done();
            self.store.save(&mut record)?;
            return Ok(record.status());
        };

        let mut file = OpenOptions::new().write(true).open(self.dump_path())?;
        if file.metadata()?.len() > cursor.log_bytes {
            debug!("Discarding unsaved dump tail past {} bytes", cursor.log_bytes);
            file.set_len(cursor.log_bytes)?;
        }
        file.seek(SeekFrom::Start(cursor.log_bytes))?;
        let mut log = BufWriter::new(file);

        if cursor.row_offset == 0 {
            write_entry(
                &mut log,
                &DumpEntry {
                    entry_type: EntryType::TableSchema,
                    table: Some(table.clone()),
                    prefix: None,
                    statements: table_schema(self.conn, &table)?,
                },
            )?;
        }

        let chunk = self.config.chunk_size;
        let (rows, has_more) = read_rows(self.conn, &table, chunk, cursor.row_offset)?;
        for statement in &rows {
            write_entry(
                &mut log,
                &DumpEntry {
                    entry_type: EntryType::Row,
                    table: Some(table.clone()),
                    prefix: None,
                    statements: vec![statement.clone()],
                },
            )?;
        }
        log.flush()?;
        let file = log.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        cursor.log_bytes = file.metadata()?.len();

        let dumped = record.done_units + rows.len() as u64;
        if has_more {
            cursor.row_offset += chunk;
        } else {
            debug!("Finished table {} at offset {}", table, cursor.row_offset);
            cursor.table_index += 1;
            cursor.row_offset = 0;
        }
        let finished = cursor.table_index >= cursor.tables.len();
        record.advance(cursor, dumped);
        if finished {
            record.mark_done();
            info!("✅ Dump complete: {}", self.dump_path().display());
        }
        self.store.save(&mut record)?;
        Ok(record.status())
    }

    /// Deletes the progress record. The dump log is kept.
    pub fn finish(&self) -> Result<(), StepError> {
        self.store.delete()?;
        self.session
            .log(&format!("dump finished: {}", self.dump_path().display()))?;
        Ok(())
    }
}

/// Statements replayed before any table, the SQLite counterpart of charset,
/// foreign-key and sql-mode session settings.
fn header_statements() -> Vec<String> {
    vec![
        "PRAGMA encoding = 'UTF-8'".to_string(),
        "PRAGMA foreign_keys = OFF".to_string(),
        "PRAGMA defer_foreign_keys = ON".to_string(),
    ]
}

fn list_tables(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// `DROP` + `CREATE` for a table, followed by its explicit indexes.
fn table_schema(conn: &Connection, table: &str) -> Result<Vec<String>, StepError> {
    let create: String = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    let mut statements = vec![
        format!("DROP TABLE IF EXISTS {}", quote_ident(table)),
        create,
    ];

    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master \
         WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name",
    )?;
    for sql in stmt.query_map(params![table], |row| row.get::<_, String>(0))? {
        statements.push(sql?);
    }
    Ok(statements)
}

/// Reads up to `limit` rows as INSERT statements. The second value tells
/// whether more rows follow.
fn read_rows(
    conn: &Connection,
    table: &str,
    limit: u64,
    offset: u64,
) -> Result<(Vec<String>, bool), StepError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} LIMIT ?1 OFFSET ?2",
        quote_ident(table)
    ))?;
    let columns: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| quote_ident(name))
        .collect();
    let column_list = columns.join(", ");
    let insert = format!("INSERT INTO {} ({}) VALUES", quote_ident(table), column_list);

    // One extra row looks ahead for the end of the table.
    let mut rows = stmt.query(params![(limit + 1) as i64, offset as i64])?;
    let mut statements = Vec::new();
    let mut has_more = false;
    while let Some(row) = rows.next()? {
        if statements.len() as u64 == limit {
            has_more = true;
            break;
        }
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(literal(row.get_ref(i)?));
        }
        statements.push(format!("{} ({})", insert, values.join(", ")));
    }
    Ok((statements, has_more))
}

fn write_entry(out: &mut impl Write, entry: &DumpEntry) -> Result<(), StepError> {
    serde_json::to_writer(&mut *out, entry)?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::TempDir;

    fn seed(conn: &Connection, table: &str, rows: usize) {
        conn.execute_batch(&format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY, name TEXT)",
            table
        ))
        .unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        for i in 0..rows {
            tx.execute(
                &format!("INSERT INTO {} (name) VALUES (?1)", table),
                params![format!("row {}", i)],
            )
            .unwrap();
        }
        tx.commit().unwrap();
    }

    fn read_log(path: &std::path::Path) -> Vec<DumpEntry> {
        BufReader::new(File::open(path).unwrap())
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect()
    }

    fn run_to_end(dumper: &Dumper<'_>) -> usize {
        let mut steps = 0;
        loop {
            steps += 1;
            if dumper.step().unwrap().done {
                return steps;
            }
        }
    }

    #[test]
    fn test_three_table_scenario_takes_five_steps() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, "users", 2_500);
        seed(&conn, "posts", 500);
        seed(&conn, "options", 10);

        let out = dir.path().join("out");
        let session = Session::new(dir.path(), "dump", "mem", out.to_str().unwrap()).unwrap();
        let dumper = Dumper::new(session, &conn, DumpConfig::default());
        let status = dumper.start(&[]).unwrap();
        assert_eq!(status.total_units, 3_010);

        assert_eq!(run_to_end(&dumper), 5);

        let entries = read_log(&dumper.dump_path());
        assert_eq!(entries[0].entry_type, EntryType::Header);
        let schema_order: Vec<_> = entries
            .iter()
            .filter(|e| e.entry_type == EntryType::TableSchema)
            .map(|e| e.table.clone().unwrap())
            .collect();
        assert_eq!(schema_order, vec!["options", "posts", "users"]);
        let rows = entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Row)
            .count();
        assert_eq!(rows, 3_010);
    }

    #[test]
    fn test_chunk_boundaries() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, "exact", 4);
        let session = Session::new(dir.path(), "a", "mem", dir.path().join("a-out").to_str().unwrap())
            .unwrap();
        let config = DumpConfig {
            chunk_size: 4,
            ..DumpConfig::default()
        };
        let dumper = Dumper::new(session, &conn, config.clone());
        dumper.start(&[]).unwrap();
        assert_eq!(run_to_end(&dumper), 1);

        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, "over", 5);
        let session = Session::new(dir.path(), "b", "mem", dir.path().join("b-out").to_str().unwrap())
            .unwrap();
        let dumper = Dumper::new(session, &conn, config);
        dumper.start(&[]).unwrap();
        let first = dumper.step().unwrap();
        assert!(!first.done);
        assert_eq!(first.done_units, 4);
        assert!(dumper.step().unwrap().done);
    }

    #[test]
    fn test_excluded_tables_use_prefix() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, "wp_users", 3);
        seed(&conn, "wp_sessions", 3);
        let session =
            Session::new(dir.path(), "x", "mem", dir.path().join("out").to_str().unwrap()).unwrap();
        let config = DumpConfig {
            table_prefix: "wp_".to_string(),
            ..DumpConfig::default()
        };
        let dumper = Dumper::new(session, &conn, config);
        dumper.start(&["sessions".to_string()]).unwrap();
        run_to_end(&dumper);

        let entries = read_log(&dumper.dump_path());
        assert_eq!(entries[0].prefix.as_deref(), Some("wp_"));
        assert!(entries
            .iter()
            .all(|e| e.table.as_deref() != Some("wp_sessions")));
        assert!(entries
            .iter()
            .any(|e| e.table.as_deref() == Some("wp_users")));
    }

    #[test]
    fn test_resume_discards_unsaved_tail() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, "t", 3);
        let out = dir.path().join("out");
        let session = Session::new(dir.path(), "r", "mem", out.to_str().unwrap()).unwrap();
        let config = DumpConfig {
            chunk_size: 2,
            ..DumpConfig::default()
        };
        let dumper = Dumper::new(session.clone(), &conn, config.clone());
        dumper.start(&[]).unwrap();
        dumper.step().unwrap();

        // A step that wrote lines but died before saving progress.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dumper.dump_path())
            .unwrap();
        file.write_all(b"{\"type\":\"row\",\"statements\":[\"INSERT").unwrap();
        drop(file);

        let resumed = Dumper::new(session, &conn, config);
        assert!(resumed.step().unwrap().done);
        let entries = read_log(&resumed.dump_path());
        let rows = entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Row)
            .count();
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_step_without_start() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        let session = Session::new(dir.path(), "none", "mem", "out").unwrap();
        let dumper = Dumper::new(session, &conn, DumpConfig::default());
        assert!(matches!(dumper.step(), Err(StepError::NotStarted(_))));
    }
}
