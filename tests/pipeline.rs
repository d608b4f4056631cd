//! End-to-end scenarios over the scan-verify-upload pipeline, exercised
//! against a stub `RemoteClient` and the in-memory `TestFileTransfer`
//! double, with no real network or subprocess calls.

use async_trait::async_trait;
use mydata_agent::controller::PipelineController;
use mydata_agent::events::PipelineEvent;
use mydata_agent::remote::dto::*;
use mydata_agent::remote::error::RemoteError;
use mydata_agent::remote::RemoteClient;
use mydata_agent::scan;
use mydata_agent::settings::{FolderStructure, Settings};
use mydata_agent::transfer::TestFileTransfer;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct StubRemote {
    next_experiment_id: AtomicI64,
    next_dataset_id: AtomicI64,
    instrument_names: Mutex<Vec<String>>,
    datafiles: Mutex<Vec<DatafileDto>>,
    staging_approved: bool,
    experiment_create_calls: AtomicU64,
}

impl StubRemote {
    fn new(staging_approved: bool) -> Self {
        StubRemote {
            next_experiment_id: AtomicI64::new(1),
            next_dataset_id: AtomicI64::new(1),
            instrument_names: Mutex::new(vec!["Microscope1".to_string()]),
            datafiles: Mutex::new(vec![]),
            staging_approved,
            experiment_create_calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl RemoteClient for StubRemote {
    async fn get_user_by_username(&self, u: &str) -> Result<Option<UserDto>, RemoteError> {
        Ok(Some(UserDto {
            id: 1,
            username: u.to_string(),
            email: None,
        }))
    }
    async fn get_user_by_email(&self, _e: &str) -> Result<Option<UserDto>, RemoteError> {
        Ok(None)
    }
    async fn get_groups_for_user(&self, _u: i64) -> Result<Vec<GroupDto>, RemoteError> {
        Ok(vec![])
    }
    async fn get_facilities_for_user(&self, _u: i64) -> Result<Vec<FacilityDto>, RemoteError> {
        Ok(vec![FacilityDto {
            id: 1,
            name: "Facility1".to_string(),
        }])
    }
    async fn get_instrument_by_facility_and_name(&self, _f: i64, name: &str) -> Result<Option<InstrumentDto>, RemoteError> {
        if self.instrument_names.lock().unwrap().iter().any(|n| n == name) {
            Ok(Some(InstrumentDto {
                id: 1,
                name: name.to_string(),
                facility: _f,
            }))
        } else {
            Ok(None)
        }
    }
    async fn create_instrument(&self, facility_id: i64, name: &str) -> Result<InstrumentDto, RemoteError> {
        self.instrument_names.lock().unwrap().push(name.to_string());
        Ok(InstrumentDto {
            id: 1,
            name: name.to_string(),
            facility: facility_id,
        })
    }
    async fn rename_instrument(&self, _instrument_id: i64, new_name: &str) -> Result<(), RemoteError> {
        if self.instrument_names.lock().unwrap().iter().any(|n| n == new_name) {
            return Err(RemoteError::DuplicateKey);
        }
        Ok(())
    }
    async fn get_or_create_experiment_for_folder(&self, title: &str, instrument: i64) -> Result<ExperimentDto, RemoteError> {
        self.experiment_create_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_experiment_id.fetch_add(1, Ordering::SeqCst);
        let _ = instrument;
        Ok(ExperimentDto {
            id,
            title: title.to_string(),
        })
    }
    async fn create_dataset_if_necessary(&self, experiment: i64, description: &str) -> Result<DatasetDto, RemoteError> {
        let id = self.next_dataset_id.fetch_add(1, Ordering::SeqCst);
        Ok(DatasetDto {
            id,
            description: description.to_string(),
            experiment,
        })
    }
    async fn lookup_datafile_by_fingerprint(
        &self,
        _dataset_id: i64,
        _file_name: &str,
        _size: u64,
        _digest: &str,
    ) -> Result<Vec<DatafileDto>, RemoteError> {
        Ok(self.datafiles.lock().unwrap().clone())
    }
    async fn create_datafile_bulk(&self, _d: i64, _f: &str, _s: u64, _m: &str, _b: Vec<u8>) -> Result<(), RemoteError> {
        Ok(())
    }
    async fn create_datafile_staged(
        &self,
        _dataset_id: i64,
        file_name: &str,
        _size: u64,
        _digest_sha512: &str,
    ) -> Result<StagedDatafileResponse, RemoteError> {
        Ok(StagedDatafileResponse {
            staging_path: format!("/staging/{}", file_name),
        })
    }
    async fn request_staging_access(&self) -> Result<StagingAccessResponse, RemoteError> {
        Ok(StagingAccessResponse {
            approved: self.staging_approved,
        })
    }
}

fn write_file(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
}

async fn run_pipeline(settings: &Settings, remote: Arc<StubRemote>, transfer: Arc<TestFileTransfer>, test_run: bool) -> (String, Vec<PipelineEvent>) {
    let (events_tx, mut events_rx) = mydata_agent::events::channel();
    let events_log = Arc::new(Mutex::new(Vec::new()));
    let events_log_clone = events_log.clone();
    let collector = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let is_finished = matches!(event, PipelineEvent::RunFinished { .. });
            events_log_clone.lock().unwrap().push(event);
            if is_finished {
                break;
            }
        }
    });

    let scan_events_tx = events_tx.clone();
    let controller = PipelineController::new(settings.clone(), remote, transfer, events_tx, test_run);
    controller.init_for_uploads().await.unwrap();

    let folders = scan::scan_folders(settings, &scan_events_tx).await;
    let folders = match folders {
        Ok(f) => f,
        Err(e) => {
            // Scanning failed before any RunFinished event was ever going to
            // be sent, so the collector task would otherwise block forever;
            // let the runtime drop it at test teardown instead of awaiting it.
            collector.abort();
            return (format!("{:#}", e), events_log.lock().unwrap().clone());
        }
    };
    for folder in folders {
        controller.start_uploads_for_folder(folder).await;
    }
    controller.finished_scanning_for_dataset_folders().await;
    let summary = controller.run_to_completion().await;
    let _ = collector.await;
    (summary, events_log.lock().unwrap().clone())
}

fn base_settings(data_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.instrument_name = "Microscope1".to_string();
    settings.facility_name = "Facility1".to_string();
    settings.contact_name = "Alice".to_string();
    settings.contact_email = "alice@example.com".to_string();
    settings.data_directory = data_dir.to_string_lossy().to_string();
    settings.mytardis_url = "https://example.com".to_string();
    settings.username = "alice".to_string();
    settings.api_key = "secret".to_string();
    settings.max_verification_threads = 2;
    settings.max_upload_threads = 2;
    settings
}

#[tokio::test]
async fn username_dataset_two_users_five_files_all_new() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("testuser1/Birds/bird1.jpg"), "1");
    write_file(&dir.path().join("testuser1/Birds/bird2.jpg"), "22");
    write_file(&dir.path().join("testuser1/Birds/bird3.jpg"), "333");
    write_file(&dir.path().join("testuser2/Flowers/rose1.jpg"), "4444");
    write_file(&dir.path().join("testuser2/Flowers/rose2.jpg"), "55555");

    let mut settings = base_settings(dir.path());
    settings.folder_structure = FolderStructure::UsernameDataset;

    let remote = Arc::new(StubRemote::new(true));
    let transfer = Arc::new(TestFileTransfer::default());
    let (summary, _events) = run_pipeline(&settings, remote, transfer.clone(), false).await;

    assert_eq!(summary, "The run completed successfully.");
    assert_eq!(transfer.copies.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn all_files_already_verified_reports_no_new_files() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("testuser1/Exp1/Dataset1/a.dat"), "hello");

    let mut settings = base_settings(dir.path());
    settings.folder_structure = FolderStructure::UsernameExperimentDataset;

    let remote = Arc::new(StubRemote::new(true));
    remote.datafiles.lock().unwrap().push(DatafileDto {
        id: 1,
        filename: "a.dat".to_string(),
        size: 5,
        verified: true,
        staged: false,
        staged_bytes: None,
    });
    let transfer = Arc::new(TestFileTransfer::default());
    let (summary, _events) = run_pipeline(&settings, remote, transfer.clone(), false).await;

    assert_eq!(summary, "No new files were found to upload.");
    assert!(transfer.copies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pending_staging_access_falls_back_to_bulk_http() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("testuser1/Birds/bird1.jpg"), "1");

    let mut settings = base_settings(dir.path());
    settings.folder_structure = FolderStructure::UsernameDataset;

    let remote = Arc::new(StubRemote::new(false));
    let transfer = Arc::new(TestFileTransfer::default());
    let (summary, events) = run_pipeline(&settings, remote, transfer.clone(), false).await;

    assert_eq!(summary, "The run completed successfully.");
    // BulkHTTP never touches the FileTransfer double.
    assert!(transfer.copies.lock().unwrap().is_empty());
    let warnings: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Message { level: mydata_agent::events::MessageLevel::Warning, .. }))
        .collect();
    assert_eq!(warnings.len(), 1);
}

#[tokio::test]
async fn invalid_folder_structure_terminates_with_no_uploads() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("onlyonecomponent.jpg"), "1");

    let mut settings = base_settings(dir.path());
    settings.folder_structure = FolderStructure::UsernameDataset;

    let remote = Arc::new(StubRemote::new(true));
    let transfer = Arc::new(TestFileTransfer::default());
    let (summary, _events) = run_pipeline(&settings, remote, transfer.clone(), false).await;

    assert!(summary.contains("InvalidFolderStructure"));
    assert!(transfer.copies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rename_instrument_collision_is_duplicate_key() {
    let remote = StubRemote::new(true);
    let err = remote.rename_instrument(1, "Microscope1").await.unwrap_err();
    assert!(matches!(err, RemoteError::DuplicateKey));
    assert_eq!(remote.instrument_names.lock().unwrap()[0], "Microscope1");
}

#[tokio::test]
async fn test_run_mode_acknowledges_uploads_without_transferring() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("testuser1/Birds/bird1.jpg"), "1");

    let mut settings = base_settings(dir.path());
    settings.folder_structure = FolderStructure::UsernameDataset;

    let remote = Arc::new(StubRemote::new(true));
    let transfer = Arc::new(TestFileTransfer::default());
    let (summary, events) = run_pipeline(&settings, remote, transfer.clone(), true).await;

    assert_eq!(summary, "The run completed successfully.");
    assert!(transfer.copies.lock().unwrap().is_empty());
    let would_upload = events.iter().any(|e| matches!(e, PipelineEvent::Message { text, .. } if text.contains("would upload")));
    assert!(would_upload);
}
