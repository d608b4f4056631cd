//! Upload worker pool: dispatches each file that needs action
//! to either the bulk-HTTP or staged transfer path, and reports progress and
//! completion through the event channel.

pub mod bulk;
pub mod staged;

use crate::events::{EventSender, PipelineEvent};
use crate::model::{FileFingerprint, UploadRecord, UploadState};
use crate::remote::RemoteClient;
use crate::transfer::FileTransfer;
use chrono::Utc;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};

/// Upload method chosen once per run during pool initialization. Selected by
/// `select_upload_method` against the staging-access response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMethod {
    BulkHttp,
    Staged,
}

/// One unit of upload work.
pub struct UploadTask {
    pub fingerprint: FileFingerprint,
    pub local_path: std::path::PathBuf,
    pub remote_dir: String,
    pub remote_file_name: String,
}

/// Decide the upload method and pool size for this run: if
/// staging access is absent, fall back to BulkHttp with a warning; if
/// present and approved, use Staged; if present but pending, fall back to
/// BulkHttp with a "request pending" warning. Either fallback also clamps
/// the upload pool to size 1.
pub async fn select_upload_method(
    remote: &dyn RemoteClient,
    configured_pool_size: usize,
    events: &EventSender,
) -> (UploadMethod, usize) {
    match remote.request_staging_access().await {
        Ok(resp) if resp.approved => (UploadMethod::Staged, configured_pool_size.max(1)),
        Ok(_) => {
            let _ = events.send(PipelineEvent::Message {
                level: crate::events::MessageLevel::Warning,
                text: "Staging access request is pending approval; falling back to bulk HTTP uploads.".to_string(),
            });
            (UploadMethod::BulkHttp, 1)
        }
        Err(e) => {
            warn!("[PHASE: upload] [STEP: select_method] staging access lookup failed: {:#}", e);
            let _ = events.send(PipelineEvent::Message {
                level: crate::events::MessageLevel::Warning,
                text: "No staging access available; falling back to bulk HTTP uploads.".to_string(),
            });
            (UploadMethod::BulkHttp, 1)
        }
    }
}

/// Run one upload task to completion, honoring `should_abort` between the
/// setup step and the transfer itself. Does not mutate `cache`: uploads do
/// not populate the verified-files cache — that is the verification pool's
/// job on a subsequent run.
pub async fn run_upload_task(
    method: UploadMethod,
    remote: &dyn RemoteClient,
    transfer: &dyn FileTransfer,
    task: &UploadTask,
    should_abort: &AtomicBool,
    events: &EventSender,
) -> UploadRecord {
    let mut record = UploadRecord::new(task.fingerprint.clone());
    record.state = UploadState::InProgress;
    record.started_at = Some(Utc::now());

    if should_abort.load(Ordering::SeqCst) {
        record.state = UploadState::Canceled;
        let _ = events.send(PipelineEvent::UploadOutcome {
            fingerprint: task.fingerprint.clone(),
            state: record.state,
        });
        return record;
    }

    let result = match method {
        UploadMethod::BulkHttp => bulk::upload_bulk(remote, task).await,
        UploadMethod::Staged => staged::upload_staged(remote, transfer, task, should_abort, events).await,
    };

    record.latest_at = Some(Utc::now());
    record.state = match result {
        Ok(()) if should_abort.load(Ordering::SeqCst) => UploadState::Canceled,
        Ok(()) => UploadState::Completed,
        Err(e) => {
            warn!("[PHASE: upload] [STEP: outcome] upload failed for {:?}: {:#}", task.local_path, e);
            UploadState::Failed
        }
    };

    let _ = events.send(PipelineEvent::UploadOutcome {
        fingerprint: task.fingerprint.clone(),
        state: record.state,
    });
    record
}
