//! # sideload-dl
//!
//! Embeddable sideloading pipeline: queued download, extraction and device
//! installation for packaged applications.
//!
//! ## Design Philosophy
//!
//! sideload-dl is designed to be:
//! - **Crash-safe** - The queue is persisted on every mutation and items
//!   interrupted mid-stage are requeued on the next start
//! - **Single-flight** - Exactly one item is ever downloading, extracting or
//!   installing; user actions race the pipeline safely
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sideload_dl::{AdbBridge, Config, Sideloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.source.base_uri = "https://mirror.example.com/releases".to_string();
//!
//!     let bridge = AdbBridge::from_path().ok_or("adb not found")?;
//!     let sideloader = Sideloader::new(config, Arc::new(bridge)).await?;
//!
//!     // Subscribe to events
//!     let mut events = sideloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     sideloader
//!         .add_to_queue("release-1", "com.example.app", "Example App")
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Device-bridge interface and adb implementation
pub mod device;
/// Error types
pub mod error;
/// Archive extraction stage
pub mod extraction;
/// Device installation stage
pub mod install;
/// Core sideloader implementation (decomposed into focused submodules)
pub mod sideloader;
/// Persisted queue store
pub mod store;
/// Archive transfer stage
pub mod transfer;
/// Core types and events
pub mod types;

mod notify;
mod utils;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, PersistenceConfig, SourceConfig, ToolsConfig};
pub use device::{AdbBridge, DeviceBridge, DeviceInfo, DeviceState};
pub use error::{Error, InstallError, Result, StoreError, TransferError};
pub use sideloader::{Capabilities, Sideloader};
pub use store::QueueStore;
pub use transfer::TransportMode;
pub use types::{Event, QueueItem, QueueStats, ReleaseId, Status, TransferProgress};

/// Helper function to run the sideloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the sideloader's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use sideload_dl::{AdbBridge, Config, Sideloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bridge = AdbBridge::from_path().ok_or("adb not found")?;
///     let sideloader = Sideloader::new(Config::default(), Arc::new(bridge)).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(sideloader).await;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(sideloader: Sideloader) {
    wait_for_signal().await;
    sideloader.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
