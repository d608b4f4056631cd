//! Typed notification channel the controller writes to, consumed by
//! whatever UI or logging layer is observing a run.

use crate::model::{FileFingerprint, UploadState, VerificationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// "scanned N of M owner folders" style progress tick.
    ScanProgress { scanned: usize, total: usize },
    /// A user-visible message, already deduplicated by the controller.
    Message { level: MessageLevel, text: String },
    VerificationOutcome {
        fingerprint: FileFingerprint,
        state: VerificationState,
    },
    UploadProgress {
        fingerprint: FileFingerprint,
        bytes_uploaded: u64,
        total_bytes: u64,
    },
    UploadOutcome {
        fingerprint: FileFingerprint,
        state: UploadState,
    },
    /// Emitted exactly once, from the shutdown handler, when the run reaches
    /// a terminal state.
    RunFinished { summary: String },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<PipelineEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<PipelineEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
