//! Chunked multi-part zip builder.
//!
//! The directory tree is walked once by [`ArchiveBuilder::start`] and the
//! resulting file list is stored in the progress record. Every
//! [`ArchiveBuilder::step`] then appends up to `chunk_size` entries to the
//! current part, opening `<base>_part<N>.zip` whenever the next file would
//! push the current part past `max_part_size`. Each part is finished (central
//! directory written) at the end of every step, so parts are valid zip files
//! between calls.

use crate::error::StepError;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::session::Session;
use crate::types::{ArchiveConfig, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// One file or directory captured by the initial walk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: PathBuf,
    /// `/`-separated path inside the archive.
    pub relative: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Resume position of an archive build.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCursor {
    pub file_index: usize,
    /// 1-based sequence number of the open part.
    pub part_index: u32,
    /// Uncompressed bytes already in the open part.
    pub part_bytes: u64,
    /// First file index written to the open part.
    pub part_first_index: usize,
    pub parts: Vec<PathBuf>,
    pub files: Vec<FileEntry>,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Share of the three counts above that belongs to the open part.
    #[serde(default)]
    pub part_processed: u64,
    #[serde(default)]
    pub part_skipped: u64,
    #[serde(default)]
    pub part_errors: u64,
}

impl ArchiveCursor {
    fn record_added(&mut self) {
        self.processed += 1;
        self.part_processed += 1;
    }

    fn record_skipped(&mut self) {
        self.skipped += 1;
        self.part_skipped += 1;
    }

    fn record_error(&mut self) {
        self.errors += 1;
        self.part_errors += 1;
    }

    fn start_next_part(&mut self, path: PathBuf, first_index: usize) {
        self.part_index += 1;
        self.parts.push(path);
        self.part_bytes = 0;
        self.part_first_index = first_index;
        self.part_processed = 0;
        self.part_skipped = 0;
        self.part_errors = 0;
    }

    /// Moves back to the first entry of the open part and drops the counts
    /// of the entries that will be replayed.
    fn rewind_part(&mut self) {
        self.file_index = self.part_first_index;
        self.part_bytes = 0;
        self.processed = self.processed.saturating_sub(self.part_processed);
        self.skipped = self.skipped.saturating_sub(self.part_skipped);
        self.errors = self.errors.saturating_sub(self.part_errors);
        self.part_processed = 0;
        self.part_skipped = 0;
        self.part_errors = 0;
    }
}

/// Files up to this size are read into memory before their entry is started.
const MEMORY_STAGE_LIMIT: u64 = 16 * 1024 * 1024;

const SPOOL_FILE: &str = "archive.spool";

/// Source bytes captured before an entry is started. A source that fails to
/// read is reported before the part is touched.
enum Staged {
    Memory(Vec<u8>),
    Spool { path: PathBuf, len: u64 },
}

impl Staged {
    fn len(&self) -> u64 {
        match self {
            Staged::Memory(bytes) => bytes.len() as u64,
            Staged::Spool { len, .. } => *len,
        }
    }
}

/// Path of part `index` (1-based) for an archive whose first part is `first`.
pub fn part_path(first: &Path, index: u32) -> PathBuf {
    if index <= 1 {
        return first.to_path_buf();
    }
    let stem = first
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    first.with_file_name(format!("{}_part{}.zip", stem, index))
}

/// Part files currently on disk for `first`, in sequence order.
pub fn existing_parts(first: &Path) -> Vec<PathBuf> {
    let mut parts = Vec::new();
    if first.exists() {
        parts.push(first.to_path_buf());
    }
    let mut index = 2;
    loop {
        let path = part_path(first, index);
        if !path.exists() {
            break;
        }
        parts.push(path);
        index += 1;
    }
    parts
}

struct OpenPart {
    writer: ZipWriter<File>,
    names: HashSet<String>,
}

fn open_part(path: &Path) -> Result<OpenPart, StepError> {
    let has_content = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    if !has_content {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        return Ok(OpenPart {
            writer: ZipWriter::new(File::create(path)?),
            names: HashSet::new(),
        });
    }

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let names = ZipArchive::new(&file)?
        .file_names()
        .map(str::to_string)
        .collect();
    Ok(OpenPart {
        writer: ZipWriter::new_append(file)?,
        names,
    })
}

/// Builds a multi-part zip archive in bounded steps.
pub struct ArchiveBuilder {
    session: Session,
    config: ArchiveConfig,
    store: ProgressStore,
}

impl ArchiveBuilder {
    /// `session.destination` is the path of the first part (`<name>.zip`).
    pub fn new(session: Session, config: ArchiveConfig) -> Self {
        let store = session.progress_store();
        Self {
            session,
            config,
            store,
        }
    }

    fn first_part(&self) -> PathBuf {
        PathBuf::from(&self.session.destination)
    }

    /// Walks `source_dir` once and records the file list.
    ///
    /// Entries whose first path segment is in `exclude_names` are skipped,
    /// as are this archive's own part files.
    pub fn start(&self, source_dir: &Path, exclude_names: &[String]) -> Result<StepStatus, StepError> {
        if source_dir.as_os_str().is_empty() {
            return Err(StepError::Validation("source directory is required".to_string()));
        }
        if self.session.destination.is_empty() {
            return Err(StepError::Validation("archive path is required".to_string()));
        }
        if self.config.chunk_size == 0 || self.config.max_part_size == 0 {
            return Err(StepError::Validation(
                "chunk size and max part size must be positive".to_string(),
            ));
        }
        if !source_dir.is_dir() {
            return Err(StepError::SourceUnavailable(format!(
                "{} is not a readable directory",
                source_dir.display()
            )));
        }

        let first = self.first_part();
        let files = collect_files(source_dir, exclude_names, &first);
        if files.is_empty() {
            return Err(StepError::NoFilesFound(source_dir.display().to_string()));
        }

        for stale in existing_parts(&first) {
            debug!("Removing stale part {}", stale.display());
            fs::remove_file(stale)?;
        }

        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        info!(
            "📦 Archiving {} entries ({} bytes) from {} into {}",
            files.len(),
            total_bytes,
            source_dir.display(),
            first.display()
        );
        self.session.log(&format!(
            "archive started: {} entries from {}",
            files.len(),
            source_dir.display()
        ))?;

        let cursor = ArchiveCursor {
            part_index: 1,
            parts: vec![first],
            files,
            ..ArchiveCursor::default()
        };
        let total = cursor.files.len() as u64;
        let mut record = ProgressRecord::new(cursor, total);
        self.store.save(&mut record)?;
        Ok(report(&record, Vec::new()))
    }

    /// Adds the next chunk of entries.
    pub fn step(&self) -> Result<StepStatus, StepError> {
        let mut record: ProgressRecord<ArchiveCursor> = self
            .store
            .load()?
            .ok_or_else(|| StepError::NotStarted(self.session.id.clone()))?;
        if record.done {
            return Ok(report(&record, Vec::new()));
        }

        let mut cursor = record.cursor.clone();
        let mut current = part_path(&self.first_part(), cursor.part_index);
        let mut part = match open_part(&current) {
            Ok(part) => part,
            Err(StepError::ZipError(e)) => {
                // Killed while writing: the part has no central directory.
                warn!(
                    "Part {} is unreadable ({}), rebuilding it from entry {}",
                    current.display(),
                    e,
                    cursor.part_first_index
                );
                fs::remove_file(&current)?;
                cursor.rewind_part();
                open_part(&current)?
            }
            Err(e) => return Err(e),
        };

        let options = if self.config.store_only {
            FileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            FileOptions::default().compression_method(CompressionMethod::Deflated)
        };
        let dir_options = FileOptions::default().compression_method(CompressionMethod::Stored);

        let end = (cursor.file_index + self.config.chunk_size).min(cursor.files.len());
        let spool = self.session.work_dir().join(SPOOL_FILE);
        let mut errors = Vec::new();

        while cursor.file_index < end {
            let entry = cursor.files[cursor.file_index].clone();
            cursor.file_index += 1;

            if entry.is_dir {
                let name = format!("{}/", entry.relative);
                if part.names.contains(&name) {
                    cursor.record_skipped();
                    continue;
                }
                match part.writer.add_directory(entry.relative.clone(), dir_options) {
                    Ok(()) => {
                        part.names.insert(name);
                        cursor.record_added();
                    }
                    Err(e) => {
                        cursor.record_error();
                        errors.push(format!("{}: {}", entry.relative, e));
                    }
                }
                continue;
            }

            if part.names.contains(&entry.relative) {
                debug!("{} already in {}", entry.relative, current.display());
                cursor.record_skipped();
                continue;
            }

            let (metadata, staged) = match fs::metadata(&entry.path)
                .and_then(|metadata| stage_file(&entry, &metadata, &spool).map(|s| (metadata, s)))
            {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path.display(), e);
                    cursor.record_error();
                    errors.push(format!("{}: {}", entry.relative, e));
                    continue;
                }
            };
            let size = staged.len();

            if cursor.part_bytes + size > self.config.max_part_size && !part.names.is_empty() {
                part.writer.finish()?;
                let next = part_path(&self.first_part(), cursor.part_index + 1);
                info!(
                    "📂 Part full at {} bytes, opening {}",
                    cursor.part_bytes,
                    next.display()
                );
                part = OpenPart {
                    writer: ZipWriter::new(File::create(&next)?),
                    names: HashSet::new(),
                };
                let first_index = cursor.file_index - 1;
                cursor.start_next_part(next.clone(), first_index);
                current = next;
            }

            if let Err(e) = write_staged(&mut part.writer, &entry, &metadata, options, staged) {
                // The entry is half written and cannot be taken back out of
                // the part, so the whole part is rebuilt on the next step.
                warn!(
                    "Failed while writing {} into {}: {}",
                    entry.relative,
                    current.display(),
                    e
                );
                drop(part);
                fs::remove_file(&current)?;
                cursor.rewind_part();
                record.cursor = cursor;
                self.store.save(&mut record)?;
                return Err(e);
            }
            part.names.insert(entry.relative.clone());
            cursor.part_bytes += size;
            cursor.record_added();
        }

        part.writer.finish()?;

        let index = cursor.file_index as u64;
        let finished = cursor.file_index >= cursor.files.len();
        record.advance(cursor, index);
        if finished {
            record.mark_done();
            self.store.delete()?;
            info!(
                "✅ Archive complete: {} part(s), {} added, {} error(s)",
                record.cursor.parts.len(),
                record.cursor.processed,
                record.cursor.errors
            );
            self.session.log(&format!(
                "archive finished: {} part(s), {} error(s)",
                record.cursor.parts.len(),
                record.cursor.errors
            ))?;
        } else {
            self.store.save(&mut record)?;
        }
        Ok(report(&record, errors))
    }

    /// Drops the progress record and, unless `keep_parts`, the part files.
    pub fn cleanup(&self, keep_parts: bool) -> Result<(), StepError> {
        self.store.delete()?;
        if !keep_parts {
            for part in existing_parts(&self.first_part()) {
                fs::remove_file(part)?;
            }
        }
        Ok(())
    }
}

fn report(record: &ProgressRecord<ArchiveCursor>, errors: Vec<String>) -> StepStatus {
    StepStatus {
        processed: record.cursor.processed,
        skipped: record.cursor.skipped,
        error_count: record.cursor.errors,
        errors,
        parts: record.cursor.parts.clone(),
        ..record.status()
    }
}

/// Reads the whole source before anything is written to the part. Large
/// files go through a spool file in the session directory.
fn stage_file(entry: &FileEntry, metadata: &fs::Metadata, spool: &Path) -> io::Result<Staged> {
    if metadata.len() <= MEMORY_STAGE_LIMIT {
        return Ok(Staged::Memory(fs::read(&entry.path)?));
    }
    if let Some(parent) = spool.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut source = File::open(&entry.path)?;
    let mut out = File::create(spool)?;
    match io::copy(&mut source, &mut out) {
        Ok(len) => Ok(Staged::Spool {
            path: spool.to_path_buf(),
            len,
        }),
        Err(e) => {
            let _ = fs::remove_file(spool);
            Err(e)
        }
    }
}

fn write_staged(
    writer: &mut ZipWriter<File>,
    entry: &FileEntry,
    metadata: &fs::Metadata,
    options: FileOptions,
    staged: Staged,
) -> Result<(), StepError> {
    let mut options = options.large_file(staged.len() >= u32::MAX as u64);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode());
    }
    #[cfg(not(unix))]
    let _ = metadata;
    writer.start_file(entry.relative.clone(), options)?;
    match staged {
        Staged::Memory(bytes) => writer.write_all(&bytes)?,
        Staged::Spool { path, .. } => {
            let copied = File::open(&path).and_then(|mut spool| io::copy(&mut spool, writer));
            let _ = fs::remove_file(&path);
            copied?;
        }
    }
    Ok(())
}

fn collect_files(source_dir: &Path, exclude_names: &[String], first_part: &Path) -> Vec<FileEntry> {
    let walker = WalkDir::new(source_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1 || !exclude_names.iter().any(|n| e.file_name() == n.as_str())
        });

    let own_dir = first_part
        .parent()
        .and_then(|p| fs::canonicalize(if p.as_os_str().is_empty() { Path::new(".") } else { p }).ok());

    let mut files = Vec::new();
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if is_own_part(entry.path(), first_part, own_dir.as_deref()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let is_dir = entry.file_type().is_dir();
        let size = if is_dir {
            0
        } else {
            entry.metadata().map(|m| m.len()).unwrap_or(0)
        };
        files.push(FileEntry {
            path: entry.path().to_path_buf(),
            relative,
            is_dir,
            size,
        });
    }
    files
}

fn is_own_part(path: &Path, first_part: &Path, own_dir: Option<&Path>) -> bool {
    let (Some(name), Some(first_name), Some(stem)) = (
        path.file_name().and_then(|n| n.to_str()),
        first_part.file_name().and_then(|n| n.to_str()),
        first_part.file_stem().and_then(|n| n.to_str()),
    ) else {
        return false;
    };
    let is_part_name = name == first_name
        || name
            .strip_prefix(&format!("{}_part", stem))
            .and_then(|rest| rest.strip_suffix(".zip"))
            .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
    if !is_part_name {
        return false;
    }
    let parent = path.parent().and_then(|p| fs::canonicalize(p).ok());
    parent.as_deref() == own_dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn entries_of(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn builder(root: &TempDir, id: &str, config: ArchiveConfig) -> ArchiveBuilder {
        let dest = root.path().join("out").join("site.zip");
        let session = Session::new(root.path().join("sessions"), id, "", dest.to_str().unwrap())
            .unwrap();
        ArchiveBuilder::new(session, config)
    }

    fn run(builder: &ArchiveBuilder) -> (usize, StepStatus) {
        let mut steps = 0;
        loop {
            steps += 1;
            let status = builder.step().unwrap();
            if status.done {
                return (steps, status);
            }
        }
    }

    #[test]
    fn test_part_names() {
        let first = Path::new("/backups/site.zip");
        assert_eq!(part_path(first, 1), PathBuf::from("/backups/site.zip"));
        assert_eq!(part_path(first, 3), PathBuf::from("/backups/site_part3.zip"));
    }

    #[test]
    fn test_empty_directory_has_no_files() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let builder = builder(&root, "empty", ArchiveConfig::default());
        assert!(matches!(
            builder.start(&src, &[]),
            Err(StepError::NoFilesFound(_))
        ));
    }

    #[test]
    fn test_archive_with_excludes_in_chunks() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        write(&src.join("a.txt"), b"alpha");
        write(&src.join("docs/b.txt"), b"beta");
        write(&src.join("cache/c.txt"), b"gamma");
        write(&src.join("docs/cache/d.txt"), b"delta");

        let config = ArchiveConfig {
            chunk_size: 2,
            ..ArchiveConfig::default()
        };
        let builder = builder(&root, "basic", config);
        let status = builder.start(&src, &["cache".to_string()]).unwrap();
        assert_eq!(status.total_units, 5);

        let (steps, status) = run(&builder);
        assert_eq!(steps, 3);
        assert_eq!(status.processed, 5);
        assert_eq!(status.parts.len(), 1);
        assert!(!builder.session.progress_store().path().exists());

        assert_eq!(
            entries_of(&status.parts[0]),
            vec!["a.txt", "docs/", "docs/b.txt", "docs/cache/", "docs/cache/d.txt"]
        );
        let mut archive = ZipArchive::new(File::open(&status.parts[0]).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("docs/b.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "beta");
    }

    #[test]
    fn test_splits_into_parts_without_splitting_files() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        for i in 0..5 {
            write(&src.join(format!("f{}.bin", i)), &vec![i as u8; 400]);
        }
        let config = ArchiveConfig {
            chunk_size: 10,
            max_part_size: 1_000,
            store_only: true,
        };
        let builder = builder(&root, "split", config);
        builder.start(&src, &[]).unwrap();
        let (_, status) = run(&builder);

        assert_eq!(status.parts.len(), 3);
        assert_eq!(status.parts[1], root.path().join("out/site_part2.zip"));
        let mut all = Vec::new();
        for part in &status.parts {
            let mut archive = ZipArchive::new(File::open(part).unwrap()).unwrap();
            for i in 0..archive.len() {
                let entry = archive.by_index(i).unwrap();
                assert_eq!(entry.size(), 400);
                all.push(entry.name().to_string());
            }
        }
        all.sort();
        assert_eq!(all, vec!["f0.bin", "f1.bin", "f2.bin", "f3.bin", "f4.bin"]);
    }

    #[test]
    fn test_replayed_step_does_not_duplicate_entries() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        for i in 0..4 {
            write(&src.join(format!("f{}.txt", i)), b"data");
        }
        let config = ArchiveConfig {
            chunk_size: 2,
            ..ArchiveConfig::default()
        };
        let builder = builder(&root, "replay", config.clone());
        builder.start(&src, &[]).unwrap();
        builder.step().unwrap();

        // Crash after the zip was written but before progress was saved.
        let progress = builder.session.progress_store().path().to_path_buf();
        let saved = fs::read(&progress).unwrap();
        builder.step().unwrap();
        fs::write(&progress, saved).unwrap();

        let resumed = self::builder(&root, "replay", config);
        let (_, status) = run(&resumed);
        assert_eq!(status.skipped, 2);
        assert_eq!(
            entries_of(&status.parts[0]),
            vec!["f0.txt", "f1.txt", "f2.txt", "f3.txt"]
        );
    }

    #[test]
    fn test_missing_file_is_collected_not_fatal() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        write(&src.join("keep.txt"), b"keep");
        write(&src.join("gone.txt"), b"gone");
        let builder = builder(&root, "missing", ArchiveConfig::default());
        builder.start(&src, &[]).unwrap();
        fs::remove_file(src.join("gone.txt")).unwrap();

        let status = builder.step().unwrap();
        assert!(status.done);
        assert_eq!(status.error_count, 1);
        assert!(status.errors[0].starts_with("gone.txt"));
        assert_eq!(entries_of(&status.parts[0]), vec!["keep.txt"]);
    }

    #[test]
    fn test_unreadable_source_leaves_part_intact() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        write(&src.join("a.txt"), b"alpha");
        write(&src.join("b.txt"), b"beta");
        write(&src.join("c.txt"), b"gamma");
        let builder = builder(&root, "unreadable", ArchiveConfig::default());
        builder.start(&src, &[]).unwrap();
        // Still has metadata, but reading it as a file fails.
        fs::remove_file(src.join("b.txt")).unwrap();
        fs::create_dir(src.join("b.txt")).unwrap();

        let status = builder.step().unwrap();
        assert!(status.done);
        assert_eq!(status.processed, 2);
        assert_eq!(status.error_count, 1);
        assert!(status.errors[0].starts_with("b.txt"));

        let mut archive = ZipArchive::new(File::open(&status.parts[0]).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        archive
            .by_name("c.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "gamma");
    }

    #[test]
    fn test_corrupt_part_is_rebuilt_without_inflating_counts() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        for i in 0..4 {
            write(&src.join(format!("f{}.txt", i)), b"data");
        }
        let config = ArchiveConfig {
            chunk_size: 2,
            ..ArchiveConfig::default()
        };
        let builder = builder(&root, "corrupt", config);
        builder.start(&src, &[]).unwrap();
        assert_eq!(builder.step().unwrap().processed, 2);

        // Killed while the central directory was being written.
        let first = root.path().join("out/site.zip");
        fs::write(&first, b"not a zip at all").unwrap();

        let (_, status) = run(&builder);
        assert_eq!(status.processed, 4);
        assert_eq!(status.skipped, 0);
        assert_eq!(status.error_count, 0);
        assert_eq!(
            entries_of(&first),
            vec!["f0.txt", "f1.txt", "f2.txt", "f3.txt"]
        );
    }

    #[test]
    fn test_rewind_drops_counts_of_open_part() {
        let mut cursor = ArchiveCursor {
            file_index: 7,
            part_first_index: 4,
            part_bytes: 900,
            processed: 6,
            skipped: 1,
            errors: 1,
            part_processed: 2,
            part_skipped: 1,
            ..ArchiveCursor::default()
        };
        cursor.rewind_part();
        assert_eq!(cursor.file_index, 4);
        assert_eq!(cursor.part_bytes, 0);
        assert_eq!((cursor.processed, cursor.skipped, cursor.errors), (4, 0, 1));
        assert_eq!(cursor.part_processed, 0);
    }

    #[test]
    fn test_skips_own_parts_inside_source() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("out");
        write(&src.join("site.zip"), b"old");
        write(&src.join("site_part2.zip"), b"old");
        write(&src.join("page.html"), b"<html>");
        let builder = builder(&root, "own", ArchiveConfig::default());
        let status = builder.start(&src, &[]).unwrap();
        assert_eq!(status.total_units, 1);
        let (_, status) = run(&builder);
        assert_eq!(entries_of(&status.parts[0]), vec!["page.html"]);
        assert!(!src.join("site_part2.zip").exists());
    }
}
