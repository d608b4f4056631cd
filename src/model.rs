//! Core data model: Folder, User, Group, Experiment, Dataset, Instrument,
//! FileFingerprint, VerificationRecord, UploadRecord.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

/// Identity record mapped from a folder-path component via the folder
/// structure template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub upstream_id: String,
    pub server_id: Option<i64>,
    /// True when the template permits users without a resolvable server record.
    pub no_server_mapping: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub server_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    User(User),
    Group(Group),
}

impl Owner {
    pub fn label(&self) -> &str {
        match self {
            Owner::User(u) => &u.upstream_id,
            Owner::Group(g) => &g.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: i64,
    pub description: String,
    pub experiment_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub id: i64,
    pub name: String,
    pub facility_id: i64,
}

/// A dataset-level grouping of files belonging to one owner within one
/// experiment. Once emitted by the scanner, `files` is frozen for the run.
#[derive(Debug, Clone)]
pub struct Folder {
    pub owner: Arc<Owner>,
    pub experiment_title: String,
    pub dataset_name: String,
    pub local_path: PathBuf,
    pub files: Vec<FolderFile>,
    pub created_date: DateTime<Utc>,
    pub experiment_ref: Option<Experiment>,
    pub dataset_ref: Option<Dataset>,
}

#[derive(Debug, Clone)]
pub struct FolderFile {
    pub relative_path: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl Folder {
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn folder_name(&self) -> String {
        format!("{}/{}", self.owner.label(), self.experiment_title)
    }

    /// A per-Folder-unique key for completion tracking. Two Folders with the
    /// same owner and experiment title can still be distinct datasets (e.g.
    /// `UsernameExperimentDataset`), so `folder_name()` alone is not unique
    /// enough to key a "finished counting" map.
    pub fn tracking_key(&self) -> String {
        self.local_path.to_string_lossy().into_owned()
    }
}

/// The tuple used to decide server-side equivalence. `digest` is a
/// cryptographic hash computed locally on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileFingerprint {
    pub dataset_id: i64,
    pub file_name: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    NotStarted,
    InProgress,
    FoundVerified,
    FoundUnverifiedFullSize,
    FoundUnverifiedPartial,
    NotFoundOnServer,
    Failed,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, VerificationState::NotStarted | VerificationState::InProgress)
    }
}

#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub fingerprint: FileFingerprint,
    pub state: VerificationState,
    pub bytes_uploaded_previously: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::Completed | UploadState::Failed | UploadState::Canceled
        )
    }
}

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub fingerprint: FileFingerprint,
    pub state: UploadState,
    pub bytes_uploaded: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub latest_at: Option<DateTime<Utc>>,
    /// Set only when the staged method is used; lets cancellation kill the
    /// external transfer subprocess.
    pub transfer_pid: Option<u32>,
}

impl UploadRecord {
    pub fn new(fingerprint: FileFingerprint) -> Self {
        UploadRecord {
            fingerprint,
            state: UploadState::NotStarted,
            bytes_uploaded: 0,
            started_at: None,
            latest_at: None,
            transfer_pid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_state_terminal_classification() {
        assert!(!VerificationState::NotStarted.is_terminal());
        assert!(!VerificationState::InProgress.is_terminal());
        assert!(VerificationState::FoundVerified.is_terminal());
        assert!(VerificationState::Failed.is_terminal());
    }

    #[test]
    fn upload_state_terminal_classification() {
        assert!(!UploadState::InProgress.is_terminal());
        assert!(UploadState::Completed.is_terminal());
        assert!(UploadState::Canceled.is_terminal());
    }
}
