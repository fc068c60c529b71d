//! Configuration types for sideload-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Download behavior configuration (directories, update cadence, cleanup)
///
/// Groups settings related to how archives are fetched and stored.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root directory receiving one subdirectory per release (default: "./downloads")
    ///
    /// Mutable at runtime via `set_download_path`; the latest value applies to
    /// newly enqueued items only.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Minimum interval between queue-changed notifications in milliseconds (default: 100)
    ///
    /// Progress events arriving faster than this are coalesced; the final
    /// state is always delivered.
    #[serde(default = "default_debounce_ms")]
    pub progress_debounce_ms: u64,

    /// Delete the release's artifacts and drop its record after a successful
    /// device install (default: false)
    #[serde(default)]
    pub delete_after_install: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            progress_debounce_ms: default_debounce_ms(),
            delete_after_install: false,
        }
    }
}

/// Remote source configuration (mirror base URI and credential)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URI the per-release archive paths are resolved against
    #[serde(default)]
    pub base_uri: String,

    /// Optional bearer token sent to the remote source
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// External tool paths (rclone, 7z)
///
/// Groups settings for external binaries. Used as a nested sub-config within
/// [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to rclone executable (auto-detected if None)
    #[serde(default)]
    pub rclone_path: Option<PathBuf>,

    /// Path to 7z executable (auto-detected if None)
    #[serde(default)]
    pub sevenzip_path: Option<PathBuf>,

    /// Whether to search PATH for missing tool binaries (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rclone_path: None,
            sevenzip_path: None,
            search_path: true,
        }
    }
}

/// Queue snapshot persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path of the JSON queue snapshot (default: "./queue.json")
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_path: default_queue_path(),
        }
    }
}

/// Top-level configuration for the sideloader
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Remote source settings
    #[serde(default)]
    pub source: SourceConfig,

    /// External tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Persistence settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("./queue.json")
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}
