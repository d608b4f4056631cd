//! Pipeline controller: owns both worker pools, the two work
//! queues, the lifecycle flags, and the single completion predicate. This is
//! the "single authority that decides the run is finished."
//!
//! Each pool is modeled as a fixed number of long-lived `tokio::spawn`
//! workers sharing one `tokio::sync::mpsc` receiver behind a
//! `tokio::sync::Mutex`: every worker pulls from the same queue until it
//! receives a shutdown sentinel, realized with async tasks rather than OS
//! threads blocking on a shared queue.

use crate::cache::VerifiedFilesCache;
use crate::events::{EventSender, MessageLevel, PipelineEvent};
use crate::model::{Folder, UploadState, VerificationState};
use crate::remote::error::RemoteError;
use crate::remote::RemoteClient;
use crate::settings::Settings;
use crate::transfer::FileTransfer;
use crate::upload::{self, UploadMethod, UploadTask};
use crate::verify::{self, VerificationTask};
use anyhow::{anyhow, Context, Result};
use log::warn;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// Walks an `anyhow::Error`'s source chain looking for a `RemoteError` the
/// controller should treat as fatal to the run, even after it's been wrapped
/// in one or more `.context(...)` layers.
fn is_fatal_remote_error(e: &anyhow::Error) -> bool {
    e.chain().filter_map(|cause| cause.downcast_ref::<RemoteError>()).any(RemoteError::is_fatal)
}

enum VerifyMsg {
    Task(VerificationTask),
    Shutdown,
}

enum UploadMsg {
    Task(UploadTask),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Running,
    ShuttingDown,
    Completed,
    Failed,
    Canceled,
}

#[derive(Default)]
struct Counters {
    verifications_to_perform: AtomicU64,
    verifications_completed: AtomicU64,
    verifications_failed: AtomicU64,
    uploads_to_perform: AtomicU64,
    uploads_completed: AtomicU64,
    uploads_failed: AtomicU64,
    uploads_canceled: AtomicU64,
    uploads_acknowledged: AtomicU64,
}

pub struct PipelineController {
    settings: Settings,
    remote: Arc<dyn RemoteClient>,
    transfer: Arc<dyn FileTransfer>,
    events: EventSender,

    state: Mutex<RunState>,
    should_abort: Arc<AtomicBool>,
    test_run: bool,

    cache: Mutex<Option<Arc<VerifiedFilesCache>>>,
    counters: Counters,

    /// Resolved once in `init_for_uploads`, before any folder is processed.
    instrument_id: Mutex<Option<i64>>,
    /// Serializes get-or-create-experiment across folders sharing a title.
    experiment_lock: Mutex<HashMap<String, (i64, i64)>>,
    /// Per-folder "finished counting" flags, keyed by `Folder::tracking_key`
    /// (the local dataset directory path) rather than `folder_name()`, since
    /// two distinct datasets can share the same owner and experiment title.
    finished_counting: Mutex<HashMap<String, bool>>,
    last_message: Mutex<Option<String>>,

    upload_method: Mutex<Option<UploadMethod>>,

    verify_tx: mpsc::UnboundedSender<VerifyMsg>,
    verify_rx: Arc<Mutex<mpsc::UnboundedReceiver<VerifyMsg>>>,
    upload_tx: mpsc::UnboundedSender<UploadMsg>,
    upload_rx: Arc<Mutex<mpsc::UnboundedReceiver<UploadMsg>>>,

    verify_workers: Mutex<Vec<JoinHandle<()>>>,
    upload_workers: Mutex<Vec<JoinHandle<()>>>,

    scan_complete: AtomicBool,
    completion_notify: Notify,
}

impl PipelineController {
    pub fn new(
        settings: Settings,
        remote: Arc<dyn RemoteClient>,
        transfer: Arc<dyn FileTransfer>,
        events: EventSender,
        test_run: bool,
    ) -> Arc<Self> {
        let (verify_tx, verify_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        Arc::new(PipelineController {
            settings,
            remote,
            transfer,
            events,
            state: Mutex::new(RunState::Idle),
            should_abort: Arc::new(AtomicBool::new(false)),
            test_run,
            cache: Mutex::new(None),
            counters: Counters::default(),
            instrument_id: Mutex::new(None),
            experiment_lock: Mutex::new(HashMap::new()),
            finished_counting: Mutex::new(HashMap::new()),
            last_message: Mutex::new(None),
            upload_method: Mutex::new(None),
            verify_tx,
            verify_rx: Arc::new(Mutex::new(verify_rx)),
            upload_tx,
            upload_rx: Arc::new(Mutex::new(upload_rx)),
            verify_workers: Mutex::new(Vec::new()),
            upload_workers: Mutex::new(Vec::new()),
            scan_complete: AtomicBool::new(false),
            completion_notify: Notify::new(),
        })
    }

    async fn emit_message(&self, level: MessageLevel, text: String) {
        let mut last = self.last_message.lock().await;
        if last.as_deref() != Some(text.as_str()) {
            *last = Some(text.clone());
            let _ = self.events.send(PipelineEvent::Message { level, text });
        }
    }

    /// `InitForUploads`: resets counters, opens the cache, chooses the
    /// upload method, and starts both worker pools.
    pub async fn init_for_uploads(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            *state = RunState::Initializing;
        }
        self.should_abort.store(false, Ordering::SeqCst);
        self.scan_complete.store(false, Ordering::SeqCst);

        let cache = match VerifiedFilesCache::open(&self.settings.cache_file_path()).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                self.fail_run(format!("Failed to open verified-files cache: {:#}", e)).await;
                return Err(e);
            }
        };
        *self.cache.lock().await = Some(cache);

        let instrument_id = match self.resolve_instrument().await {
            Ok(id) => id,
            Err(e) => {
                self.fail_run(format!("Failed to resolve instrument: {:#}", e)).await;
                return Err(e);
            }
        };
        *self.instrument_id.lock().await = Some(instrument_id);

        let (method, pool_size) = upload::select_upload_method(
            self.remote.as_ref(),
            self.settings.max_upload_threads,
            &self.events,
        )
        .await;
        *self.upload_method.lock().await = Some(method);

        self.spawn_verify_pool(self.settings.max_verification_threads.max(1));
        self.spawn_upload_pool(method, pool_size);

        {
            let mut state = self.state.lock().await;
            *state = RunState::Running;
        }
        Ok(())
    }

    /// Resolve (creating if necessary) the Instrument named by
    /// `settings.instrument_name` under `settings.facility_name`, for the
    /// acting user identified by `settings.username`. Run once, before any
    /// experiment is created.
    async fn resolve_instrument(&self) -> Result<i64> {
        let user = self
            .remote
            .get_user_by_username(&self.settings.username)
            .await
            .context("failed to look up acting user")?
            .ok_or_else(|| anyhow!("no user found for username {:?}", self.settings.username))?;

        let facilities = self
            .remote
            .get_facilities_for_user(user.id)
            .await
            .context("failed to list facilities for user")?;
        let facility = facilities
            .into_iter()
            .find(|f| f.name.eq_ignore_ascii_case(&self.settings.facility_name))
            .ok_or_else(|| anyhow!("facility {:?} not found for user {:?}", self.settings.facility_name, self.settings.username))?;

        if let Some(instrument) = self
            .remote
            .get_instrument_by_facility_and_name(facility.id, &self.settings.instrument_name)
            .await
            .context("failed to look up instrument")?
        {
            return Ok(instrument.id);
        }

        let created = self
            .remote
            .create_instrument(facility.id, &self.settings.instrument_name)
            .await
            .context("failed to create instrument")?;
        Ok(created.id)
    }

    fn spawn_verify_pool(self: &Arc<Self>, pool_size: usize) {
        for _ in 0..pool_size {
            let controller = self.clone();
            let rx = self.verify_rx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    let msg = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match msg {
                        Some(VerifyMsg::Task(task)) => {
                            controller.process_verify_task(task).await;
                        }
                        Some(VerifyMsg::Shutdown) | None => break,
                    }
                }
            });
            self.verify_workers.blocking_push(handle);
        }
    }

    fn spawn_upload_pool(self: &Arc<Self>, method: UploadMethod, pool_size: usize) {
        for _ in 0..pool_size {
            let controller = self.clone();
            let rx = self.upload_rx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    let msg = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match msg {
                        Some(UploadMsg::Task(task)) => {
                            controller.process_upload_task(method, task).await;
                        }
                        Some(UploadMsg::Shutdown) | None => break,
                    }
                }
            });
            self.upload_workers.blocking_push(handle);
        }
    }

    async fn process_verify_task(self: &Arc<Self>, task: VerificationTask) {
        if self.should_abort.load(Ordering::SeqCst) {
            return;
        }
        let cache = { self.cache.lock().await.clone() };
        let cache = match cache {
            Some(c) => c,
            None => return,
        };

        let fingerprint_file_name = task.file_name.clone();
        let dataset_id = task.dataset_id;
        let local_path = task.file_path.clone();

        let outcome = verify::verify_file(self.remote.as_ref(), cache.as_ref(), &task).await;
        let state = match outcome {
            Ok(s) => {
                self.counters.verifications_completed.fetch_add(1, Ordering::SeqCst);
                s
            }
            Err(e) if is_fatal_remote_error(&e) => {
                warn!("[PHASE: controller] [STEP: verify] fatal remote error for {:?}: {:#}", local_path, e);
                self.abort_for_fatal_remote_error(format!("Stopping run: {:#}", e)).await;
                return;
            }
            Err(e) => {
                warn!("[PHASE: controller] [STEP: verify] lookup failed for {:?}: {:#}", local_path, e);
                self.counters.verifications_failed.fetch_add(1, Ordering::SeqCst);
                VerificationState::Failed
            }
        };

        let fingerprint = crate::model::FileFingerprint {
            dataset_id,
            file_name: fingerprint_file_name.clone(),
            size: 0,
            digest: String::new(),
        };
        let _ = self.events.send(PipelineEvent::VerificationOutcome {
            fingerprint,
            state,
        });

        let needs_upload = matches!(
            state,
            VerificationState::NotFoundOnServer | VerificationState::FoundUnverifiedPartial
        );
        if needs_upload {
            self.enqueue_upload(dataset_id, local_path, fingerprint_file_name).await;
        } else {
            self.check_completion().await;
        }
    }

    async fn enqueue_upload(self: &Arc<Self>, dataset_id: i64, local_path: std::path::PathBuf, file_name: String) {
        if self.test_run {
            self.counters.uploads_acknowledged.fetch_add(1, Ordering::SeqCst);
            let _ = self.events.send(PipelineEvent::Message {
                level: MessageLevel::Info,
                text: format!("Test run: would upload {:?}", local_path),
            });
            self.check_completion().await;
            return;
        }

        self.counters.uploads_to_perform.fetch_add(1, Ordering::SeqCst);
        let size = tokio::fs::metadata(&local_path).await.map(|m| m.len()).unwrap_or(0);
        let task = UploadTask {
            fingerprint: crate::model::FileFingerprint {
                dataset_id,
                file_name: file_name.clone(),
                size,
                digest: String::new(),
            },
            local_path,
            remote_dir: format!("dataset-{}", dataset_id),
            remote_file_name: file_name,
        };
        let _ = self.upload_tx.send(UploadMsg::Task(task));
    }

    async fn process_upload_task(self: &Arc<Self>, method: UploadMethod, task: UploadTask) {
        let record = upload::run_upload_task(
            method,
            self.remote.as_ref(),
            self.transfer.as_ref(),
            &task,
            &self.should_abort,
            &self.events,
        )
        .await;

        match record.state {
            UploadState::Completed => self.counters.uploads_completed.fetch_add(1, Ordering::SeqCst),
            UploadState::Failed => self.counters.uploads_failed.fetch_add(1, Ordering::SeqCst),
            UploadState::Canceled => self.counters.uploads_canceled.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
        self.check_completion().await;
    }

    /// `StartUploadsForFolder`: increments the verification counter,
    /// serializes experiment/dataset creation, then enqueues one
    /// VerifyTask per file.
    pub async fn start_uploads_for_folder(self: &Arc<Self>, folder: Folder) {
        let folder_name = folder.folder_name();
        let tracking_key = folder.tracking_key();
        self.counters
            .verifications_to_perform
            .fetch_add(folder.num_files() as u64, Ordering::SeqCst);
        self.finished_counting.lock().await.insert(tracking_key.clone(), false);

        let experiment_id = match self.get_or_create_experiment(&folder).await {
            Ok(id) => id,
            Err(e) if is_fatal_remote_error(&e) => {
                self.abort_for_fatal_remote_error(format!("Stopping run: remote error resolving experiment for {}: {:#}", folder_name, e))
                    .await;
                return;
            }
            Err(e) => {
                self.emit_message(MessageLevel::Error, format!("Failed to resolve experiment for {}: {:#}", folder_name, e))
                    .await;
                self.finished_counting.lock().await.insert(tracking_key, true);
                self.check_completion().await;
                return;
            }
        };

        let dataset_id = match self.remote.create_dataset_if_necessary(experiment_id, &folder.dataset_name).await {
            Ok(d) => d.id,
            Err(e) if e.is_fatal() => {
                self.abort_for_fatal_remote_error(format!("Stopping run: remote error creating dataset for {}: {:#}", folder_name, e))
                    .await;
                return;
            }
            Err(e) => {
                self.emit_message(MessageLevel::Error, format!("Failed to create dataset for {}: {:#}", folder_name, e))
                    .await;
                self.finished_counting.lock().await.insert(tracking_key, true);
                self.check_completion().await;
                return;
            }
        };

        for file in &folder.files {
            let task = VerificationTask {
                dataset_id,
                file_path: folder.local_path.join(&file.relative_path),
                file_name: file.relative_path.clone(),
            };
            let _ = self.verify_tx.send(VerifyMsg::Task(task));
        }

        self.finished_counting.lock().await.insert(tracking_key, true);
        self.check_completion().await;
    }

    /// Serialized experiment get-or-create. `template::match_template` is
    /// not re-run here: the folder already carries its resolved title.
    async fn get_or_create_experiment(&self, folder: &Folder) -> Result<i64> {
        let mut created = self.experiment_lock.lock().await;
        if let Some((_instrument_id, experiment_id)) = created.get(&folder.experiment_title) {
            return Ok(*experiment_id);
        }

        let instrument_id = match *self.instrument_id.lock().await {
            Some(id) => id,
            None => return Err(anyhow!("instrument not resolved before experiment creation")),
        };
        let experiment = self
            .remote
            .get_or_create_experiment_for_folder(&folder.experiment_title, instrument_id)
            .await
            .context("get-or-create experiment failed")?;
        created.insert(folder.experiment_title.clone(), (instrument_id, experiment.id));
        Ok(experiment.id)
    }

    /// `FinishedScanningForDatasetFolders`: marks the scan-complete flag and
    /// runs the completion check once. Completion is driven entirely by
    /// `check_completion` being invoked after every terminal verify/upload
    /// event, so no polling loop is needed.
    pub async fn finished_scanning_for_dataset_folders(self: &Arc<Self>) {
        self.scan_complete.store(true, Ordering::SeqCst);
        self.check_completion().await;
    }

    fn all_folders_finished_counting(&self, map: &HashMap<String, bool>) -> bool {
        map.values().all(|finished| *finished)
    }

    async fn check_completion(self: &Arc<Self>) {
        if !self.scan_complete.load(Ordering::SeqCst) {
            return;
        }
        let finished_counting = self.finished_counting.lock().await;
        if !self.all_folders_finished_counting(&finished_counting) {
            return;
        }
        drop(finished_counting);

        let verifications_done = self.counters.verifications_completed.load(Ordering::SeqCst)
            + self.counters.verifications_failed.load(Ordering::SeqCst);
        let verifications_total = self.counters.verifications_to_perform.load(Ordering::SeqCst);
        if verifications_done < verifications_total {
            return;
        }

        let uploads_total = self.counters.uploads_to_perform.load(Ordering::SeqCst);
        let uploads_done = if self.test_run {
            self.counters.uploads_acknowledged.load(Ordering::SeqCst)
        } else {
            self.counters.uploads_completed.load(Ordering::SeqCst)
                + self.counters.uploads_failed.load(Ordering::SeqCst)
                + self.counters.uploads_canceled.load(Ordering::SeqCst)
        };
        if uploads_done < uploads_total {
            return;
        }

        self.completion_notify.notify_one();
    }

    /// Blocks until the completion predicate fires, then shuts down and
    /// returns the final status string.
    pub async fn run_to_completion(self: &Arc<Self>) -> String {
        self.completion_notify.notified().await;
        self.shut_down_upload_threads("completion").await
    }

    async fn fail_run(self: &Arc<Self>, reason: String) {
        self.emit_message(MessageLevel::Error, reason).await;
        let mut state = self.state.lock().await;
        *state = RunState::Failed;
    }

    /// A fatal remote error mid-run: post one message, stop enqueuing new
    /// work, and let `run_to_completion` drain and shut down the pools.
    /// Unlike `fail_run`, this does not set `RunState::Failed` directly —
    /// that would make `shut_down_upload_threads` return early without
    /// draining the worker pools it's meant to join.
    async fn abort_for_fatal_remote_error(self: &Arc<Self>, reason: String) {
        self.should_abort.store(true, Ordering::SeqCst);
        self.emit_message(MessageLevel::Error, reason).await;
        self.completion_notify.notify_one();
    }

    /// `ShutDownUploadThreads`: idempotent. Sends one shutdown sentinel per
    /// worker, joins them, closes the cache, and returns the final status
    /// string.
    pub async fn shut_down_upload_threads(self: &Arc<Self>, _reason: &str) -> String {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, RunState::ShuttingDown | RunState::Completed | RunState::Failed | RunState::Canceled) {
                return self.final_status_string(*state).await;
            }
            *state = RunState::ShuttingDown;
        }

        let verify_worker_count = self.verify_workers.lock().await.len();
        for _ in 0..verify_worker_count {
            let _ = self.verify_tx.send(VerifyMsg::Shutdown);
        }
        let upload_worker_count = self.upload_workers.lock().await.len();
        for _ in 0..upload_worker_count {
            let _ = self.upload_tx.send(UploadMsg::Shutdown);
        }

        for handle in self.verify_workers.lock().await.drain(..) {
            let _ = handle.await;
        }
        for handle in self.upload_workers.lock().await.drain(..) {
            let _ = handle.await;
        }

        if let Some(cache) = self.cache.lock().await.take() {
            if let Ok(cache) = Arc::try_unwrap(cache) {
                cache.close().await;
            }
        }

        let final_state = if self.should_abort.load(Ordering::SeqCst) {
            RunState::Canceled
        } else {
            RunState::Completed
        };
        {
            let mut state = self.state.lock().await;
            *state = final_state;
        }

        let summary = self.final_status_string(final_state).await;
        let _ = self.events.send(PipelineEvent::RunFinished { summary: summary.clone() });
        summary
    }

    async fn final_status_string(&self, state: RunState) -> String {
        match state {
            RunState::Canceled => "The upload run was canceled.".to_string(),
            RunState::Failed => "The upload run failed.".to_string(),
            _ => {
                let failed = self.counters.uploads_failed.load(Ordering::SeqCst);
                let total_uploads = self.counters.uploads_to_perform.load(Ordering::SeqCst);
                let total_folders = self.finished_counting.lock().await.len();
                if total_folders == 0 {
                    "No folders were found to upload from.".to_string()
                } else if total_uploads == 0 {
                    "No new files were found to upload.".to_string()
                } else if failed > 0 {
                    format!("The run completed with {} failed upload(s).", failed)
                } else {
                    "The run completed successfully.".to_string()
                }
            }
        }
    }

    /// Abort the run: sets the process-wide cancellation flag consulted by
    /// the scanner between folders, by each worker at task boundaries, and
    /// by the staged-upload transfer between steps.
    pub fn abort(&self) {
        self.should_abort.store(true, Ordering::SeqCst);
    }

    pub fn should_abort_flag(&self) -> Arc<AtomicBool> {
        self.should_abort.clone()
    }
}

trait BlockingPush<T> {
    fn blocking_push(&self, value: T);
}

impl BlockingPush<JoinHandle<()>> for Mutex<Vec<JoinHandle<()>>> {
    fn blocking_push(&self, value: JoinHandle<()>) {
        // spawn_*_pool runs inside an async context but before any await on
        // `self`; try_lock always succeeds here since nothing else holds it.
        if let Ok(mut guard) = self.try_lock() {
            guard.push(value);
        }
    }
}
