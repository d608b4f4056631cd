//! Verification worker pool: for each file, compute a
//! streaming digest, consult the local cache, then ask the remote archive
//! whether a datafile with that fingerprint already exists.
//!
//! The streaming digest loop reads the file in fixed-size chunks and never
//! buffers the whole file in memory, hashing with `Sha512` to match the
//! archive's `sha512sum` lookup field.

use crate::cache::VerifiedFilesCache;
use crate::model::{FileFingerprint, VerificationState};
use crate::remote::RemoteClient;
use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use sha2::{Digest, Sha512};
use std::path::Path;
use tokio::io::AsyncReadExt;

const DIGEST_BUF_SIZE: usize = 64 * 1024;

/// One unit of verification work: a file whose dataset has already been
/// resolved on the server.
pub struct VerificationTask {
    pub dataset_id: i64,
    pub file_path: std::path::PathBuf,
    pub file_name: String,
}

/// Stream `path` and compute its SHA-512 hex digest without buffering the
/// whole file in memory.
pub async fn digest_file(path: &Path) -> Result<(u64, String)> {
    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open failed: {:?}", path))?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; DIGEST_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total = total.saturating_add(n as u64);
    }
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    Ok((total, hex))
}

/// Verify one file: digest it, consult the cache, then (on a cache miss)
/// look it up on the remote archive. Returns the terminal
/// `VerificationState` and, on success, records the outcome in `cache`.
///
/// The two unresolvable-on-first-pass outcomes (*no datafile record yet* and
/// *staged but unconfirmed*) are folded into the single
/// `FoundUnverifiedPartial` state here — both mean "a datafile record exists
/// but its content is not yet confirmed on the server", and both are
/// retried identically by the upload side.
pub async fn verify_file(
    remote: &dyn RemoteClient,
    cache: &VerifiedFilesCache,
    task: &VerificationTask,
) -> Result<VerificationState> {
    debug!(
        "[PHASE: verify] [STEP: digest] verifying {:?} (dataset_id={})",
        task.file_path, task.dataset_id
    );
    let (size, digest) = digest_file(&task.file_path).await?;
    let fingerprint = FileFingerprint {
        dataset_id: task.dataset_id,
        file_name: task.file_name.clone(),
        size,
        digest: digest.clone(),
    };

    if cache.lookup(&fingerprint).await.is_some() {
        debug!("[PHASE: verify] [STEP: cache] cache hit for {:?}", task.file_path);
        return Ok(VerificationState::FoundVerified);
    }

    let matches = remote
        .lookup_datafile_by_fingerprint(task.dataset_id, &task.file_name, size, &digest)
        .await
        .context("remote datafile lookup failed")?;

    let state = match matches.first() {
        None => VerificationState::NotFoundOnServer,
        Some(found) if found.verified => VerificationState::FoundVerified,
        Some(found) if found.staged && found.staged_bytes.unwrap_or(0) >= found.size => {
            VerificationState::FoundUnverifiedFullSize
        }
        Some(_) => VerificationState::FoundUnverifiedPartial,
    };

    if state == VerificationState::FoundVerified {
        cache
            .insert(&fingerprint, Utc::now())
            .await
            .context("failed to record verified-files cache entry")?;
    }

    Ok(state)
}
