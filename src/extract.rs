//! Batched zip extraction.

use crate::error::StepError;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::session::Session;
use crate::types::{ExtractConfig, StepStatus};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Suffix of the sibling file an entry is written to before it is renamed
/// into place.
const PARTIAL_SUFFIX: &str = ".stepsync-tmp";

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Resume position of an extraction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExtractCursor {
    pub start_index: usize,
    pub extracted: u64,
    pub skipped: u64,
    pub errors: u64,
}

enum Outcome {
    Extracted,
    Skipped,
}

/// Extracts a zip archive in bounded batches.
///
/// There is no explicit start: the first [`Extractor::step`] begins at entry
/// 0 and the record is removed once the last batch is written.
pub struct Extractor {
    session: Session,
    config: ExtractConfig,
    store: ProgressStore,
}

impl Extractor {
    /// `session.source` is the archive, `session.destination` the target
    /// directory.
    pub fn new(session: Session, config: ExtractConfig) -> Self {
        let store = session.progress_store();
        Self {
            session,
            config,
            store,
        }
    }

    /// Extracts the next batch of entries.
    ///
    /// # Returns
    ///
    /// The cumulative counts plus the failures of this batch. Failing
    /// entries do not stop the batch.
    pub fn step(&self) -> Result<StepStatus, StepError> {
        if self.session.source.is_empty() || self.session.destination.is_empty() {
            return Err(StepError::Validation(
                "archive path and destination directory are required".to_string(),
            ));
        }
        if self.config.batch_size == 0 {
            return Err(StepError::Validation("batch size must be positive".to_string()));
        }

        let mut record: ProgressRecord<ExtractCursor> = self
            .store
            .load()?
            .unwrap_or_else(|| ProgressRecord::new(ExtractCursor::default(), 0));
        if record.done {
            return Ok(report(&record, Vec::new()));
        }

        // Re-opened on every call; the archive handle never outlives a step.
        let file = File::open(&self.session.source).map_err(|e| {
            StepError::SourceUnavailable(format!("cannot open {}: {}", self.session.source, e))
        })?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;
        let dest = PathBuf::from(&self.session.destination);
        fs::create_dir_all(&dest)?;

        let total = archive.len();
        record.total_units = total as u64;
        let mut cursor = record.cursor.clone();
        if cursor.start_index == 0 {
            info!(
                "📂 Extracting {} entries from {} to {}",
                total,
                self.session.source,
                dest.display()
            );
        }

        let end = (cursor.start_index + self.config.batch_size).min(total);
        let mut errors = Vec::new();
        for index in cursor.start_index..end {
            match extract_entry(&mut archive, index, &dest, &self.config) {
                Ok(Outcome::Extracted) => cursor.extracted += 1,
                Ok(Outcome::Skipped) => cursor.skipped += 1,
                Err(e) => {
                    warn!("Entry {} failed: {}", index, e);
                    cursor.errors += 1;
                    errors.push(format!("entry {}: {}", index, e));
                }
            }
        }

        cursor.start_index = end;
        record.advance(cursor, end as u64);
        if end >= total {
            record.mark_done();
            self.store.delete()?;
            info!(
                "✅ Extracted {} entries to {} ({} skipped, {} failed)",
                record.cursor.extracted,
                dest.display(),
                record.cursor.skipped,
                record.cursor.errors
            );
        } else {
            self.store.save(&mut record)?;
        }
        Ok(report(&record, errors))
    }

    /// Forgets any saved position so the next step starts from entry 0.
    pub fn reset(&self) -> Result<(), StepError> {
        self.store.delete()
    }
}

fn report(record: &ProgressRecord<ExtractCursor>, errors: Vec<String>) -> StepStatus {
    StepStatus {
        processed: record.cursor.extracted,
        skipped: record.cursor.skipped,
        error_count: record.cursor.errors,
        errors,
        ..record.status()
    }
}

fn first_segment(name: &str) -> &str {
    name.split('/').find(|s| !s.is_empty()).unwrap_or("")
}

fn extract_entry<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
    dest: &Path,
    config: &ExtractConfig,
) -> Result<Outcome, StepError> {
    let mut entry = archive.by_index(index)?;
    let name = entry.name().to_string();

    let first = first_segment(&name);
    if config.exclude.iter().any(|e| e == first)
        || (!config.include.is_empty() && !config.include.iter().any(|i| i == first))
    {
        debug!("Filtered out {}", name);
        return Ok(Outcome::Skipped);
    }

    let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
        return Err(StepError::Validation(format!(
            "{} escapes the destination directory",
            name
        )));
    };
    if entry.unix_mode().map(|m| m & S_IFMT == S_IFLNK).unwrap_or(false) {
        warn!("Skipping symlink entry {}", name);
        return Ok(Outcome::Skipped);
    }

    let target = dest.join(relative);
    if entry.is_dir() {
        fs::create_dir_all(&target)?;
        return Ok(Outcome::Extracted);
    }
    if target.exists() && !config.overwrite_existing {
        debug!("Not overwriting {}", target.display());
        return Ok(Outcome::Skipped);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    // Only complete files ever appear under their real name, so a replayed
    // batch never mistakes a truncated file for an extracted one.
    let partial = partial_path(&target);
    let written = File::create(&partial)
        .and_then(|mut out| io::copy(&mut entry, &mut out).and_then(|_| out.sync_all()));
    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e.into());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = entry.unix_mode() {
            let permissions = fs::Permissions::from_mode(mode & 0o7777);
            if let Err(e) = fs::set_permissions(&partial, permissions) {
                debug!("Could not restore mode of {}: {}", target.display(), e);
            }
        }
    }
    fs::rename(&partial, &target)?;
    Ok(Outcome::Extracted)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn make_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            match content {
                Some(bytes) => {
                    let options = FileOptions::default().unix_permissions(0o640);
                    zip.start_file(*name, options).unwrap();
                    zip.write_all(bytes.as_bytes()).unwrap();
                }
                None => zip.add_directory(*name, FileOptions::default()).unwrap(),
            }
        }
        zip.finish().unwrap();
    }

    fn extractor(root: &TempDir, archive: &Path, config: ExtractConfig) -> Extractor {
        let dest = root.path().join("dest");
        let session = Session::new(
            root.path().join("sessions"),
            "extract",
            archive.to_str().unwrap(),
            dest.to_str().unwrap(),
        )
        .unwrap();
        Extractor::new(session, config)
    }

    fn run(extractor: &Extractor) -> (usize, StepStatus) {
        let mut steps = 0;
        loop {
            steps += 1;
            let status = extractor.step().unwrap();
            if status.done {
                return (steps, status);
            }
        }
    }

    #[test]
    fn test_extracts_in_batches() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("a.zip");
        make_zip(
            &archive,
            &[
                ("docs/", None),
                ("docs/a.txt", Some("alpha")),
                ("docs/deep/b.txt", Some("beta")),
                ("top.txt", Some("top")),
                ("empty/", None),
            ],
        );
        let config = ExtractConfig {
            batch_size: 2,
            ..ExtractConfig::default()
        };
        let extractor = extractor(&root, &archive, config);
        let (steps, status) = run(&extractor);
        assert_eq!(steps, 3);
        assert_eq!(status.processed, 5);
        assert_eq!(status.total_units, 5);

        let dest = root.path().join("dest");
        assert_eq!(fs::read(dest.join("docs/deep/b.txt")).unwrap(), b"beta");
        assert_eq!(fs::read(dest.join("top.txt")).unwrap(), b"top");
        assert!(dest.join("empty").is_dir());
        assert!(!extractor.store.path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("top.txt")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o640);
        }
    }

    #[test]
    fn test_resumes_from_saved_index() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("a.zip");
        make_zip(
            &archive,
            &[("1.txt", Some("1")), ("2.txt", Some("2")), ("3.txt", Some("3"))],
        );
        let config = ExtractConfig {
            batch_size: 2,
            ..ExtractConfig::default()
        };
        let first = extractor(&root, &archive, config.clone());
        let status = first.step().unwrap();
        assert!(!status.done);
        assert_eq!(status.done_units, 2);
        drop(first);

        let second = extractor(&root, &archive, config);
        let status = second.step().unwrap();
        assert!(status.done);
        assert_eq!(status.processed, 3);
        assert!(root.path().join("dest/3.txt").exists());
    }

    #[test]
    fn test_filters_and_overwrite() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("a.zip");
        make_zip(
            &archive,
            &[
                ("keep/a.txt", Some("new")),
                ("keep/b.txt", Some("new")),
                ("drop/c.txt", Some("new")),
                ("other/d.txt", Some("new")),
            ],
        );
        let dest = root.path().join("dest");
        fs::create_dir_all(dest.join("keep")).unwrap();
        fs::write(dest.join("keep/a.txt"), b"old").unwrap();

        let config = ExtractConfig {
            include: vec!["keep".to_string(), "drop".to_string()],
            exclude: vec!["drop".to_string()],
            ..ExtractConfig::default()
        };
        let status = run(&extractor(&root, &archive, config.clone())).1;
        assert_eq!(status.processed, 1);
        assert_eq!(status.skipped, 3);
        assert_eq!(fs::read(dest.join("keep/a.txt")).unwrap(), b"old");
        assert!(!dest.join("drop").exists());
        assert!(!dest.join("other").exists());

        let config = ExtractConfig {
            overwrite_existing: true,
            ..config
        };
        run(&extractor(&root, &archive, config));
        assert_eq!(fs::read(dest.join("keep/a.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_interrupted_entry_is_written_again() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("a.zip");
        let body = "0123456789".repeat(100);
        make_zip(&archive, &[("data/big.txt", Some(body.as_str()))]);

        // A previous run died while copying this entry.
        let dest = root.path().join("dest");
        fs::create_dir_all(dest.join("data")).unwrap();
        fs::write(dest.join("data/big.txt.stepsync-tmp"), &body.as_bytes()[..300]).unwrap();

        let status = extractor(&root, &archive, ExtractConfig::default())
            .step()
            .unwrap();
        assert!(status.done);
        assert_eq!(status.processed, 1);
        assert_eq!(fs::read_to_string(dest.join("data/big.txt")).unwrap(), body);
        assert!(!dest.join("data/big.txt.stepsync-tmp").exists());
    }

    #[test]
    fn test_escaping_entry_is_collected() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("evil.zip");
        make_zip(
            &archive,
            &[("../evil.txt", Some("x")), ("fine.txt", Some("y"))],
        );
        let status = extractor(&root, &archive, ExtractConfig::default())
            .step()
            .unwrap();
        assert!(status.done);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.errors.len(), 1);
        assert!(!root.path().join("evil.txt").exists());
        assert!(root.path().join("dest/fine.txt").exists());
    }

    #[test]
    fn test_missing_archive() {
        let root = TempDir::new().unwrap();
        let extractor = extractor(&root, &root.path().join("none.zip"), ExtractConfig::default());
        assert!(matches!(
            extractor.step(),
            Err(StepError::SourceUnavailable(_))
        ));
    }
}
