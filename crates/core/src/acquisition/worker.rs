//! One file transfer, owning its download attempt from start to finish.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, FileSource};
use crate::metrics::DOWNLOADS;
use crate::store::{DataFile, SqliteStore, StoreError};

/// Progress is written to the attempt at most this often (in bytes).
const PROGRESS_STEP: u64 = 16 * 1024 * 1024;

/// Transfer `file` from the restore named `guid` and close `attempt_id`.
///
/// The attempt is marked downloaded only when the byte count matches the
/// size the archive listed.
pub(crate) async fn download(
    store: Arc<SqliteStore>,
    source: Arc<dyn FileSource>,
    guid: String,
    file: DataFile,
    attempt_id: i64,
) -> Result<DataFile, StoreError> {
    debug!("Downloading {} (attempt {})", file.remote_name, attempt_id);
    let (progress_tx, mut progress_rx) = mpsc::channel(8);

    let transfer = source.retrieve(&guid, &file.remote_name, &file.local_path, progress_tx);
    tokio::pin!(transfer);

    let mut reported = 0u64;
    let result = loop {
        tokio::select! {
            result = &mut transfer => break result,
            Some(bytes) = progress_rx.recv() => {
                if bytes >= reported + PROGRESS_STEP {
                    reported = bytes;
                    store.update_attempt_progress(attempt_id, &progress_text(bytes, file.size))?;
                }
            }
        }
    };

    let outcome = result.and_then(|written| match file.size {
        Some(expected) if expected != written => Err(ArchiveError::SizeMismatch {
            name: file.remote_name.clone(),
            expected,
            actual: written,
        }),
        _ => Ok(written),
    });

    match outcome {
        Ok(written) => {
            DOWNLOADS.with_label_values(&["downloaded"]).inc();
            info!("Downloaded {} ({} bytes)", file.remote_name, written);
            store.finish_download_attempt(attempt_id, true, &format!("Downloaded {} bytes", written))
        }
        Err(e) => {
            DOWNLOADS.with_label_values(&["failed"]).inc();
            warn!("Download of {} failed: {}", file.remote_name, e);
            if let Err(rm) = tokio::fs::remove_file(&file.local_path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove partial {}: {}", file.local_path.display(), rm);
                }
            }
            store.finish_download_attempt(attempt_id, false, &format!("Download failed: {}", e))
        }
    }
}

fn progress_text(bytes: u64, size: Option<u64>) -> String {
    match size {
        Some(total) if total > 0 => format!(
            "Downloaded {} of {} bytes ({:.0}%)",
            bytes,
            total,
            bytes as f64 * 100.0 / total as f64
        ),
        _ => format!("Downloaded {} bytes", bytes),
    }
}
