//! Staged upload path: create (or find) a datafile record to
//! obtain a staging path, then stream the file there over the `FileTransfer`
//! abstraction (ssh/scp in production, an in-memory double in tests).
//!
//! Progress reporting here is coarser than a dedicated monitor sampling the
//! remote file size on a timer: the transfer is a single bounded `copy()`
//! call, so progress is reported as a single before/after tick rather than
//! periodic polling. A finer-grained implementation would poll `transfer`
//! for bytes-written mid-copy; the `FileTransfer` trait does not currently
//! expose that.

use super::UploadTask;
use crate::events::{EventSender, PipelineEvent};
use crate::remote::RemoteClient;
use crate::transfer::FileTransfer;
use anyhow::{Context, Result};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};

pub async fn upload_staged(
    remote: &dyn RemoteClient,
    transfer: &dyn FileTransfer,
    task: &UploadTask,
    should_abort: &AtomicBool,
    events: &EventSender,
) -> Result<()> {
    debug!(
        "[PHASE: upload] [STEP: staged] staging {:?} (dataset_id={})",
        task.local_path, task.fingerprint.dataset_id
    );

    let staged = remote
        .create_datafile_staged(
            task.fingerprint.dataset_id,
            &task.remote_file_name,
            task.fingerprint.size,
            &task.fingerprint.digest,
        )
        .await
        .context("failed to create staged datafile record")?;

    if should_abort.load(Ordering::SeqCst) {
        return Ok(());
    }

    transfer
        .ensure_remote_dir(&task.remote_dir)
        .await
        .context("failed to ensure remote directory")?;

    let _ = events.send(PipelineEvent::UploadProgress {
        fingerprint: task.fingerprint.clone(),
        bytes_uploaded: 0,
        total_bytes: task.fingerprint.size,
    });

    if should_abort.load(Ordering::SeqCst) {
        return Ok(());
    }

    transfer
        .copy(&task.local_path, &staged.staging_path)
        .await
        .context("staged file copy failed")?;

    let _ = events.send(PipelineEvent::UploadProgress {
        fingerprint: task.fingerprint.clone(),
        bytes_uploaded: task.fingerprint.size,
        total_bytes: task.fingerprint.size,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileFingerprint;
    use crate::remote::dto::*;
    use crate::remote::error::RemoteError;
    use crate::transfer::TestFileTransfer;
    use async_trait::async_trait;

    struct StubRemote;

    #[async_trait]
    impl RemoteClient for StubRemote {
        async fn get_user_by_username(&self, _u: &str) -> Result<Option<UserDto>, RemoteError> {
            unimplemented!()
        }
        async fn get_user_by_email(&self, _e: &str) -> Result<Option<UserDto>, RemoteError> {
            unimplemented!()
        }
        async fn get_groups_for_user(&self, _u: i64) -> Result<Vec<GroupDto>, RemoteError> {
            unimplemented!()
        }
        async fn get_facilities_for_user(&self, _u: i64) -> Result<Vec<FacilityDto>, RemoteError> {
            unimplemented!()
        }
        async fn get_instrument_by_facility_and_name(
            &self,
            _f: i64,
            _n: &str,
        ) -> Result<Option<InstrumentDto>, RemoteError> {
            unimplemented!()
        }
        async fn create_instrument(&self, _f: i64, _n: &str) -> Result<InstrumentDto, RemoteError> {
            unimplemented!()
        }
        async fn rename_instrument(&self, _i: i64, _n: &str) -> Result<(), RemoteError> {
            unimplemented!()
        }
        async fn get_or_create_experiment_for_folder(
            &self,
            _t: &str,
            _i: i64,
        ) -> Result<ExperimentDto, RemoteError> {
            unimplemented!()
        }
        async fn create_dataset_if_necessary(&self, _e: i64, _d: &str) -> Result<DatasetDto, RemoteError> {
            unimplemented!()
        }
        async fn lookup_datafile_by_fingerprint(
            &self,
            _dataset_id: i64,
            _file_name: &str,
            _size: u64,
            _digest: &str,
        ) -> Result<Vec<DatafileDto>, RemoteError> {
            unimplemented!()
        }
        async fn create_datafile_bulk(
            &self,
            _d: i64,
            _f: &str,
            _s: u64,
            _m: &str,
            _b: Vec<u8>,
        ) -> Result<(), RemoteError> {
            unimplemented!()
        }
        async fn create_datafile_staged(
            &self,
            _dataset_id: i64,
            _file_name: &str,
            _size: u64,
            _digest_sha512: &str,
        ) -> Result<StagedDatafileResponse, RemoteError> {
            Ok(StagedDatafileResponse {
                staging_path: "/staging/alice/Birds/bird1.jpg".to_string(),
            })
        }
        async fn request_staging_access(&self) -> Result<StagingAccessResponse, RemoteError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn successful_staged_upload_copies_once() {
        let remote = StubRemote;
        let transfer = TestFileTransfer::default();
        let (tx, _rx) = crate::events::channel();
        let abort = AtomicBool::new(false);

        let task = UploadTask {
            fingerprint: FileFingerprint {
                dataset_id: 1,
                file_name: "bird1.jpg".to_string(),
                size: 10,
                digest: "deadbeef".to_string(),
            },
            local_path: "/local/bird1.jpg".into(),
            remote_dir: "/staging/alice/Birds".to_string(),
            remote_file_name: "bird1.jpg".to_string(),
        };

        upload_staged(&remote, &transfer, &task, &abort, &tx).await.unwrap();
        assert_eq!(transfer.copies.lock().unwrap().len(), 1);
        assert!(transfer.dirs_created.lock().unwrap().contains("/staging/alice/Birds"));
    }

    #[tokio::test]
    async fn abort_before_transfer_skips_copy() {
        let remote = StubRemote;
        let transfer = TestFileTransfer::default();
        let (tx, _rx) = crate::events::channel();
        let abort = AtomicBool::new(true);

        let task = UploadTask {
            fingerprint: FileFingerprint {
                dataset_id: 1,
                file_name: "bird1.jpg".to_string(),
                size: 10,
                digest: "deadbeef".to_string(),
            },
            local_path: "/local/bird1.jpg".into(),
            remote_dir: "/staging/alice/Birds".to_string(),
            remote_file_name: "bird1.jpg".to_string(),
        };

        upload_staged(&remote, &transfer, &task, &abort, &tx).await.unwrap();
        assert!(transfer.copies.lock().unwrap().is_empty());
    }
}
