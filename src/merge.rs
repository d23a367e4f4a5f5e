//! Chunk merging logic.

use crate::error::StepError;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

/// Concatenates chunk files, in order, into the final file.
///
/// Every chunk must exist before the output is touched. The merged file must
/// end up exactly `expected_size` bytes long.
///
/// # Arguments
///
/// * `chunks` - Chunk file paths in sequence order
/// * `final_path` - Output file path
/// * `expected_size` - Total size reported by the remote
///
/// # Returns
///
/// `Ok(())` on success, or an error if merging fails.
pub(crate) async fn merge_chunks(
    chunks: &[PathBuf],
    final_path: &Path,
    expected_size: u64,
) -> Result<(), StepError> {
    for chunk in chunks {
        if !tokio::fs::try_exists(chunk).await? {
            return Err(StepError::MissingChunk(chunk.display().to_string()));
        }
    }

    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = BufWriter::with_capacity(
        4 * 1024 * 1024,
        tokio::fs::File::create(final_path).await?,
    );
    for chunk in chunks {
        let mut file = tokio::fs::File::open(chunk).await?;
        tokio::io::copy(&mut file, &mut out).await?;
    }
    out.flush().await?;
    out.get_ref().sync_all().await?;

    let actual = tokio::fs::metadata(final_path).await?.len();
    if actual != expected_size {
        return Err(StepError::SizeMismatch {
            expected: expected_size,
            actual,
        });
    }
    info!(
        "✅ Merged {} chunks into {} ({} bytes)",
        chunks.len(),
        final_path.display(),
        actual
    );
    Ok(())
}
