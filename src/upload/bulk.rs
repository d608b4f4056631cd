//! Bulk-HTTP upload path: a single multipart POST carrying
//! metadata and the file body. No resumption; the caller's pool is clamped
//! to one concurrent worker since the underlying client is not thread-safe.

use super::UploadTask;
use crate::remote::RemoteClient;
use anyhow::{Context, Result};
use log::debug;

/// Read `task.local_path` fully and POST it in one request. Bulk uploads are
/// advertised safe only for files up to roughly 100 MB; this function does
/// not enforce that limit itself — the archive rejects oversized bodies with
/// an `HttpError`.
pub async fn upload_bulk(remote: &dyn RemoteClient, task: &UploadTask) -> Result<()> {
    debug!(
        "[PHASE: upload] [STEP: bulk] uploading {:?} (dataset_id={})",
        task.local_path, task.fingerprint.dataset_id
    );

    let body = tokio::fs::read(&task.local_path)
        .await
        .with_context(|| format!("failed to read {:?} for bulk upload", task.local_path))?;

    remote
        .create_datafile_bulk(
            task.fingerprint.dataset_id,
            &task.remote_file_name,
            task.fingerprint.size,
            &task.fingerprint.digest,
            body,
        )
        .await
        .context("bulk datafile upload failed")?;

    Ok(())
}
