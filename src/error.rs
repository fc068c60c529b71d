//! Error types for sideload-dl
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Store, Transfer, Install, etc.)
//! - A crate-wide `Result` alias
//! - A helper for bounding diagnostic messages persisted into queue records

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sideload-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a diagnostic message stored on a queue item.
///
/// Persisted records stay compact; anything longer is truncated with an
/// ellipsis marker.
pub const MAX_DIAGNOSTIC_LEN: usize = 200;

/// Main error type for sideload-dl
///
/// This is the primary error type used throughout the library. Each variant
/// includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download_dir")
        key: Option<String>,
    },

    /// Queue store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transfer-related error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Installation-related error
    #[error("install error: {0}")]
    Install(#[from] InstallError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue item not found
    #[error("item not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the item's current lifecycle state
    #[error("invalid state for {operation} on {release_id}: {current_state}")]
    InvalidState {
        /// Release the operation targeted
        release_id: String,
        /// The attempted operation (e.g., "resume")
        operation: String,
        /// Status the item was in when the operation was rejected
        current_state: String,
    },

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (rclone, 7z, adb)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, unavailable transport, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Queue store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read the queue snapshot from disk
    #[error("failed to read queue file {path}: {reason}")]
    ReadFailed {
        /// Queue file path
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Failed to write the queue snapshot to disk
    #[error("failed to write queue file {path}: {reason}")]
    WriteFailed {
        /// Queue file path
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// A record with the same release id already exists
    #[error("duplicate release: {0}")]
    Duplicate(String),
}

/// Transfer stage errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// The transfer tool could not be started at all
    #[error("failed to spawn transfer process: {0}")]
    SpawnFailed(String),

    /// The transfer tool exited with a non-zero status
    #[error("transfer process exited with {code:?}: {detail}")]
    ExitFailure {
        /// Process exit code, if the process exited normally
        code: Option<i32>,
        /// Tail of the tool's diagnostic output
        detail: String,
    },

    /// No transport is available in this environment
    #[error("no usable transport: {0}")]
    NoTransport(String),
}

/// Installation stage errors
#[derive(Debug, Error)]
pub enum InstallError {
    /// No device is currently bound to this process
    #[error("no device connected")]
    NoDevice,

    /// The requested device does not match the bound device
    #[error("device mismatch: requested {requested}, bound {bound}")]
    DeviceMismatch {
        /// Device id the caller asked to install on
        requested: String,
        /// Device id this process is currently bound to
        bound: String,
    },

    /// The bound device is no longer visible or authorized
    #[error("device {0} not present or unauthorized")]
    DeviceGone(String),

    /// No installable payload was found under the item's directory
    #[error("no installable payload at {0}")]
    NoPayload(PathBuf),

    /// The device-side install primitive failed
    #[error("install failed: {0}")]
    InstallFailed(String),

    /// Pushing auxiliary data to the device failed
    #[error("push failed: {0}")]
    PushFailed(String),
}

/// Truncate a diagnostic message to [`MAX_DIAGNOSTIC_LEN`].
///
/// Messages attached to persisted queue records are length-bounded so a noisy
/// tool failure cannot bloat the queue snapshot. Truncation respects UTF-8
/// boundaries and appends an ellipsis.
pub fn bounded_diagnostic(message: &str) -> String {
    if message.len() <= MAX_DIAGNOSTIC_LEN {
        return message.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_LEN.saturating_sub(1);
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}
