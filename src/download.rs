//! Resumable byte-range downloader.
//!
//! [`Downloader::start_download`] requests the remote size with a one-byte
//! range request. Each [`Downloader::process_step`] then fetches one chunk
//! into `<workdir>/chunks/part-<N>`; once the last chunk is on disk the
//! chunks are merged into the destination file and checked against the
//! reported size (and the ETag when it is an MD5 digest).
//!
//! A chunk file that already has the expected size is never fetched again,
//! so a process killed between writing a chunk and saving progress resumes
//! without network traffic for that chunk.

use crate::error::StepError;
use crate::merge::merge_chunks;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::session::{remove_dir_if_exists, Session};
use crate::types::{DownloadConfig, StepStatus};
use crate::verify::{chunk_is_complete, verify_md5};
use futures_util::StreamExt;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE, ETAG, RANGE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

const CHUNK_DIR: &str = "chunks";

/// Headers of the size request.
#[derive(Debug, Clone, Default)]
pub struct SizeResponse {
    pub status: u16,
    pub content_range: Option<String>,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
}

/// Where byte ranges come from.
///
/// [`HttpRangeSource`] is the real implementation; tests substitute an
/// in-memory one.
#[allow(async_fn_in_trait)]
pub trait RangeSource {
    /// Issues `Range: bytes=0-0` and reports the response headers.
    async fn fetch_size(&self, url: &str) -> Result<SizeResponse, StepError>;

    /// Requests bytes `start..=end`. A 2xx body is written to `dest`;
    /// otherwise nothing is written. Returns the HTTP status.
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        dest: &Path,
    ) -> Result<u16, StepError>;
}

/// [`RangeSource`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
}

impl HttpRangeSource {
    pub fn new(timeout: Duration) -> Result<Self, StepError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl RangeSource for HttpRangeSource {
    async fn fetch_size(&self, url: &str) -> Result<SizeResponse, StepError> {
        let response = self.client.get(url).header(RANGE, "bytes=0-0").send().await?;
        let headers = response.headers();
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Ok(SizeResponse {
            status: response.status().as_u16(),
            content_range: header(CONTENT_RANGE),
            content_length: header(CONTENT_LENGTH).and_then(|s| s.parse().ok()),
            etag: header(ETAG),
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        dest: &Path,
    ) -> Result<u16, StepError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Ok(status.as_u16());
        }

        let mut file = BufWriter::new(tokio::fs::File::create(dest).await?);
        let mut byte_stream = response.bytes_stream();
        while let Some(piece) = byte_stream.next().await {
            file.write_all(&piece?).await?;
        }
        file.flush().await?;
        Ok(status.as_u16())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Completed,
}

/// Resume position of a download. `totalSize` lives in the record's
/// `totalUnits`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCursor {
    pub status: DownloadStatus,
    pub url: String,
    pub current_offset: u64,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Downloads one remote file in byte-range chunks.
pub struct Downloader<S = HttpRangeSource> {
    session: Session,
    config: DownloadConfig,
    source: S,
    store: ProgressStore,
}

impl Downloader<HttpRangeSource> {
    /// `session.destination` is the final file path.
    pub fn new(session: Session, config: DownloadConfig) -> Result<Self, StepError> {
        let source = HttpRangeSource::new(config.request_timeout)?;
        Ok(Self::with_source(session, config, source))
    }
}

impl<S: RangeSource> Downloader<S> {
    pub fn with_source(session: Session, config: DownloadConfig, source: S) -> Self {
        let store = session.progress_store();
        Self {
            session,
            config,
            source,
            store,
        }
    }

    /// Directory holding the chunk files.
    pub fn chunk_dir(&self) -> PathBuf {
        self.session.work_dir().join(CHUNK_DIR)
    }

    /// Path of the merged output.
    pub fn final_path(&self) -> PathBuf {
        PathBuf::from(&self.session.destination)
    }

    fn chunk_path(&self, sequence: u64) -> PathBuf {
        self.chunk_dir().join(format!("part-{}", sequence))
    }

    /// Requests the remote size and records a fresh download.
    ///
    /// # Arguments
    ///
    /// * `remote_url` - File to fetch
    /// * `chunk_size` - Bytes per step, `0` uses the configured default
    pub async fn start_download(
        &self,
        remote_url: &str,
        chunk_size: u64,
    ) -> Result<StepStatus, StepError> {
        if remote_url.is_empty() {
            return Err(StepError::Validation("remote URL is required".to_string()));
        }
        if self.session.destination.is_empty() {
            return Err(StepError::Validation("final file path is required".to_string()));
        }
        let chunk_size = if chunk_size == 0 {
            self.config.chunk_size
        } else {
            chunk_size
        };
        if chunk_size == 0 {
            return Err(StepError::Validation("chunk size must be positive".to_string()));
        }

        info!("Requesting size of {}", remote_url);
        let head = self.source.fetch_size(remote_url).await?;
        if head.status != 200 && head.status != 206 {
            return Err(StepError::HttpStatus {
                url: remote_url.to_string(),
                status: head.status,
            });
        }
        let total_size = head
            .content_range
            .as_deref()
            .and_then(total_from_content_range)
            // Only a full (200) response carries the whole size in Content-Length.
            .or(if head.status == 200 {
                head.content_length
            } else {
                None
            })
            .ok_or_else(|| StepError::CannotDetermineSize(remote_url.to_string()))?;

        tokio::fs::create_dir_all(self.chunk_dir()).await?;
        let cursor = DownloadCursor {
            status: DownloadStatus::Downloading,
            url: remote_url.to_string(),
            current_offset: 0,
            chunk_size,
            etag: head.etag,
        };
        let mut record = ProgressRecord::new(cursor, total_size);
        self.store.save(&mut record)?;
        self.session.log(&format!(
            "download started: {} ({} bytes, {} byte chunks)",
            remote_url, total_size, chunk_size
        ))?;
        info!(
            "📦 Downloading {} bytes in {} chunk(s)",
            total_size,
            chunk_count(total_size, chunk_size)
        );
        Ok(record.status())
    }

    /// Fetches the next chunk, or merges once all chunks are present.
    ///
    /// A failed fetch leaves the saved offset untouched; call again to retry.
    pub async fn process_step(&self) -> Result<StepStatus, StepError> {
        let mut record: ProgressRecord<DownloadCursor> = self
            .store
            .load()?
            .ok_or_else(|| StepError::NotStarted(self.session.id.clone()))?;
        if record.cursor.status == DownloadStatus::Completed {
            return Ok(record.status());
        }

        let total = record.total_units;
        let mut cursor = record.cursor.clone();

        if cursor.current_offset < total {
            let start = cursor.current_offset;
            let end = (start + cursor.chunk_size).min(total) - 1;
            let expected = end - start + 1;
            let sequence = start / cursor.chunk_size;
            let path = self.chunk_path(sequence);

            if chunk_is_complete(&path, expected).await {
                debug!("Chunk {} already on disk, not fetching", sequence);
            } else {
                tokio::fs::create_dir_all(self.chunk_dir()).await?;
                debug!("Fetching bytes {}-{} as chunk {}", start, end, sequence);
                let status = self.source.fetch_range(&cursor.url, start, end, &path).await?;
                if !(200..300).contains(&status) {
                    let _ = tokio::fs::remove_file(&path).await;
                    warn!("Chunk {} failed with HTTP {}", sequence, status);
                    return Err(StepError::HttpStatus {
                        url: cursor.url.clone(),
                        status,
                    });
                }
                let actual = tokio::fs::metadata(&path).await?.len();
                if actual != expected {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(StepError::ChunkSizeMismatch {
                        index: sequence,
                        expected,
                        actual,
                    });
                }
            }
            cursor.current_offset = end + 1;
        }

        if cursor.current_offset >= total {
            let chunks: Vec<PathBuf> = (0..chunk_count(total, cursor.chunk_size))
                .map(|sequence| self.chunk_path(sequence))
                .collect();
            merge_chunks(&chunks, &self.final_path(), total).await?;
            if self.config.verify_checksum {
                if let Some(etag) = cursor.etag.as_deref() {
                    verify_md5(&self.final_path(), etag).await?;
                }
            }
            cursor.status = DownloadStatus::Completed;
            record.advance(cursor, total);
            record.mark_done();
            self.session.log(&format!(
                "download completed: {}",
                self.final_path().display()
            ))?;
        } else {
            let offset = cursor.current_offset;
            record.advance(cursor, offset);
        }
        self.store.save(&mut record)?;
        Ok(record.status())
    }

    /// Reads the saved progress without doing any work.
    pub fn status(&self) -> Result<StepStatus, StepError> {
        let record: ProgressRecord<DownloadCursor> = self
            .store
            .load()?
            .ok_or_else(|| StepError::NotStarted(self.session.id.clone()))?;
        Ok(record.status())
    }

    /// Removes the chunk directory and progress record, and the merged file
    /// unless `keep_final` is set.
    pub async fn cleanup(&self, keep_final: bool) -> Result<(), StepError> {
        remove_dir_if_exists(&self.chunk_dir())?;
        self.store.delete()?;
        if !keep_final {
            match tokio::fs::remove_file(self.final_path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("🧹 Cleaned up download session {}", self.session.id);
        Ok(())
    }
}

/// Parses the total out of `bytes 0-0/12345`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    total.div_ceil(chunk_size)
}
