//! Reassembles chunk backing files into the final artifact and verifies it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::download::error::DownloadError;

const COPY_BUF_SIZE: usize = 64 * 1024;
const MERGE_ATTEMPTS: u32 = 3;
const MERGE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bytes written into the output so far, shared with observers of the merge.
#[derive(Default)]
pub struct MergeProgress {
    merged: AtomicU64,
}

impl MergeProgress {
    pub fn merged(&self) -> u64 {
        self.merged.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.merged.fetch_add(n, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.merged.store(0, Ordering::Relaxed);
    }
}

/// Concatenate `backing` files in index order into `output`, then verify the
/// result. The whole merge retries on failure; backing files are left in
/// place throughout so a retry always has its inputs — only the caller may
/// remove them once the merge is final.
pub async fn merge_with_retry(
    output: &Path,
    backing: &[PathBuf],
    total_size: u64,
    progress: &MergeProgress,
) -> Result<(), DownloadError> {
    let mut attempt = 1;
    loop {
        match merge_once(output, backing, total_size, progress).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, "merge attempt failed: {e}");
                if attempt >= MERGE_ATTEMPTS {
                    return Err(e);
                }
                attempt += 1;
                remove_partial(output).await;
                progress.reset();
                tokio::time::sleep(MERGE_RETRY_DELAY).await;
            }
        }
    }
}

async fn remove_partial(output: &Path) {
    if let Err(e) = fs::remove_file(output).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove partial output before retry: {e}");
        }
    }
}

async fn merge_once(
    output: &Path,
    backing: &[PathBuf],
    total_size: u64,
    progress: &MergeProgress,
) -> Result<(), DownloadError> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut out = File::create(output).await?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    for path in backing {
        let mut input = File::open(path).await?;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            progress.add(n as u64);
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    drop(out);

    verify_output(output, total_size).await
}

/// Size check plus a first-block read as a corruption smoke test.
async fn verify_output(output: &Path, expected: u64) -> Result<(), DownloadError> {
    let meta = fs::metadata(output).await?;
    if meta.len() != expected {
        return Err(DownloadError::SizeMismatch {
            expected,
            actual: meta.len(),
        });
    }

    let mut file = File::open(output).await?;
    let mut block = vec![0u8; expected.min(1024) as usize];
    let n = file.read(&mut block).await?;
    if n == 0 && expected > 0 {
        return Err(DownloadError::SizeMismatch {
            expected,
            actual: 0,
        });
    }

    Ok(())
}
