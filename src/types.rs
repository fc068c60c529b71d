//! Core types for sideload-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a release (a distinct content build)
///
/// Several releases may map to the same installable package id; the release id
/// is the stable key for queue records and artifact directories.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(pub String);

impl ReleaseId {
    /// Create a new ReleaseId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReleaseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReleaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a queue item
///
/// Exactly one status holds at a time; at most one item queue-wide is in an
/// active status (Downloading/Extracting/Installing).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for the pipeline slot
    Queued,
    /// Transfer process running
    Downloading,
    /// Transfer stopped by user, partial data kept
    Paused,
    /// Archiver process running
    Extracting,
    /// Device install in flight
    Installing,
    /// Content pipeline finished (installable, or already installed)
    Completed,
    /// Download or extraction failed
    Error,
    /// Device installation failed
    InstallError,
    /// Stopped by user request
    Cancelled,
}

impl Status {
    /// Whether a stage process/operation owns this item right now.
    ///
    /// Active statuses cannot legitimately survive a restart: their owning
    /// process died with the previous session.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Downloading | Status::Extracting | Status::Installing)
    }

    /// Whether this status carries a diagnostic message
    pub fn is_error_state(self) -> bool {
        matches!(self, Status::Error | Status::InstallError)
    }

    /// Whether the item is eligible for a user-initiated retry
    pub fn is_retriable(self) -> bool {
        matches!(self, Status::Error | Status::InstallError | Status::Cancelled)
    }

    /// Whether enqueueing the same release again replaces this record
    pub fn is_replaceable(self) -> bool {
        matches!(self, Status::Error | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A parsed progress update from the transfer tool's output stream
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferProgress {
    /// Percent complete (0.0 to 100.0)
    pub percent: f32,
    /// Current transfer rate in bytes per second, when reported
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining, when reported
    pub eta_seconds: Option<u64>,
}

/// One sideload work item, keyed by release id
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueItem {
    /// Stable content key
    pub release_id: ReleaseId,

    /// Platform install key (package name)
    pub package_id: String,

    /// Human-readable name for UI sorting/labels
    pub display_name: String,

    /// Current lifecycle status
    pub status: Status,

    /// Download progress percentage (0.0 to 100.0)
    pub progress: f32,

    /// Extraction progress percentage; meaningful only after download completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_progress: Option<f32>,

    /// Transient download speed in bytes per second (cleared on stage exit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<u64>,

    /// Transient download ETA in seconds (cleared on stage exit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,

    /// Last failure message; present only in Error/InstallError states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// OS pid of the stage process currently running, for supervision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_pid: Option<u32>,

    /// Filesystem location owning this item's artifacts
    pub download_path: PathBuf,

    /// When the item was enqueued; drives FIFO ordering
    pub added_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a fresh Queued item
    pub fn new(
        release_id: impl Into<ReleaseId>,
        package_id: impl Into<String>,
        display_name: impl Into<String>,
        download_path: PathBuf,
    ) -> Self {
        Self {
            release_id: release_id.into(),
            package_id: package_id.into(),
            display_name: display_name.into(),
            status: Status::Queued,
            progress: 0.0,
            extract_progress: None,
            speed_bps: None,
            eta_seconds: None,
            error: None,
            process_pid: None,
            download_path,
            added_at: Utc::now(),
        }
    }

    /// Apply a partial update, keeping the record's invariants.
    ///
    /// Status transitions drive automatic field hygiene before explicit patch
    /// fields are applied:
    /// - leaving for a non-error status clears `error`
    /// - leaving for a non-active status clears `process_pid`, `speed_bps`, `eta_seconds`
    /// - returning to `Queued` resets `extract_progress`
    pub fn apply(&mut self, patch: ItemPatch) {
        if let Some(status) = patch.status {
            if !status.is_error_state() {
                self.error = None;
            }
            if !status.is_active() {
                self.process_pid = None;
                self.speed_bps = None;
                self.eta_seconds = None;
            }
            if status == Status::Queued {
                self.extract_progress = None;
            }
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(extract_progress) = patch.extract_progress {
            self.extract_progress = extract_progress;
        }
        if let Some(speed_bps) = patch.speed_bps {
            self.speed_bps = speed_bps;
        }
        if let Some(eta_seconds) = patch.eta_seconds {
            self.eta_seconds = eta_seconds;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(process_pid) = patch.process_pid {
            self.process_pid = process_pid;
        }
        if let Some(download_path) = patch.download_path {
            self.download_path = download_path;
        }
    }
}

/// Partial update for a queue item.
///
/// `None` leaves a field untouched; nullable fields use a nested `Option` so
/// callers can explicitly clear them.
#[derive(Clone, Debug, Default)]
pub struct ItemPatch {
    /// New lifecycle status
    pub status: Option<Status>,
    /// New download progress
    pub progress: Option<f32>,
    /// New extraction progress (Some(None) clears)
    pub extract_progress: Option<Option<f32>>,
    /// New transfer speed (Some(None) clears)
    pub speed_bps: Option<Option<u64>>,
    /// New transfer ETA (Some(None) clears)
    pub eta_seconds: Option<Option<u64>>,
    /// New diagnostic message (Some(None) clears)
    pub error: Option<Option<String>>,
    /// New stage process pid (Some(None) clears)
    pub process_pid: Option<Option<u32>>,
    /// New artifact directory
    pub download_path: Option<PathBuf>,
}

impl ItemPatch {
    /// Patch that only changes the status
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch for a failure transition: status plus a bounded diagnostic
    pub fn failure(status: Status, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(Some(crate::error::bounded_diagnostic(&message.into()))),
            ..Self::default()
        }
    }

    /// Patch that resets an item back to Queued for reprocessing
    pub fn requeued() -> Self {
        Self {
            status: Some(Status::Queued),
            progress: Some(0.0),
            extract_progress: Some(None),
            ..Self::default()
        }
    }
}

/// Event emitted on the broadcast channel
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The queue changed: item added/removed, status moved, or progress
    /// advanced. Coalesced by the notifier; consumers refetch via `get_queue`.
    QueueChanged,

    /// A device install finished successfully
    InstallationSuccess {
        /// Device the payload landed on
        device: String,
        /// Release that was installed
        release_id: ReleaseId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Queue statistics grouped by lifecycle bucket
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total number of items in the queue
    pub total: usize,
    /// Waiting for the pipeline slot
    pub queued: usize,
    /// Transfer in flight
    pub downloading: usize,
    /// Paused by user
    pub paused: usize,
    /// Archiver running
    pub extracting: usize,
    /// Device install in flight
    pub installing: usize,
    /// Content pipeline finished
    pub completed: usize,
    /// Error or InstallError
    pub failed: usize,
    /// Stopped by user
    pub cancelled: usize,
}
