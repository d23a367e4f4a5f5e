//! File verification utilities (chunk size checks and MD5 checksums).

use crate::error::StepError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Computes the MD5 hash of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
///
/// # Arguments
///
/// * `filename` - Path to the file
///
/// # Returns
///
/// The MD5 hash as a hexadecimal string, or an error.
pub(crate) async fn compute_file_md5(filename: &Path) -> Result<String, StepError> {
    let filename: PathBuf = filename.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use md5::{Digest, Md5};
        use std::io::Read;

        let file = std::fs::File::open(&filename)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok::<String, StepError>(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| StepError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Checks whether a chunk file is already on disk with exactly `expected` bytes.
///
/// A missing file or a file of any other size means the chunk must be
/// fetched (again).
pub(crate) async fn chunk_is_complete(path: &Path, expected: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len() == expected,
        Err(_) => false,
    }
}

/// Returns the ETag as an MD5 digest, if it is one.
///
/// Multipart-upload ETags contain a `-` and are not a digest of the content.
pub(crate) fn etag_md5(etag: &str) -> Option<String> {
    let value = etag.trim().trim_start_matches("W/").trim_matches('"');
    if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(value.to_ascii_lowercase())
    } else {
        None
    }
}

/// Verifies a merged file against the size request's ETag.
///
/// ETags that are not a plain MD5 digest are accepted without checking.
pub(crate) async fn verify_md5(path: &Path, etag: &str) -> Result<(), StepError> {
    let file_display_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let Some(expected) = etag_md5(etag) else {
        info!(
            "✅ File {} accepted (ETag {} is not an MD5 digest)",
            file_display_name, etag
        );
        return Ok(());
    };

    let actual = compute_file_md5(path).await?;
    if actual != expected {
        warn!(
            "❌ MD5 mismatch for {}: expected {}, got {}",
            file_display_name, expected, actual
        );
        return Err(StepError::ChecksumMismatch { expected, actual });
    }
    info!("✅ MD5 verified for {}", file_display_name);
    Ok(())
}
