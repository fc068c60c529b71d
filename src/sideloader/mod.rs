//! Core sideloader implementation split into focused submodules.
//!
//! The `Sideloader` struct and its methods are organized by domain:
//! - [`queue_ops`] - Queue inspection and mutation (add/remove/delete/stats)
//! - [`control`] - Item lifecycle control (pause/resume/cancel/retry)
//! - [`processor`] - Single-flight pipeline driver
//! - [`install_ops`] - Installation entry points (queue and ad hoc)

mod control;
mod install_ops;
mod processor;
mod queue_ops;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::device::DeviceBridge;
use crate::error::Result;
use crate::extraction::ExtractionStage;
use crate::install::InstallStage;
use crate::notify::QueueNotifier;
use crate::store::QueueStore;
use crate::transfer::{TransferStage, TransportMode};
use crate::types::Event;
use processor::PipelineSlot;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

/// What this environment can actually do, resolved at construction
#[derive(Clone, Debug)]
pub struct Capabilities {
    /// Transport the download stage selected
    pub transport: TransportMode,
    /// Whether paused downloads can continue from partial data
    pub resumable_downloads: bool,
    /// Whether an archiver binary was found
    pub extraction_available: bool,
    /// Name of the device-bridge implementation in use
    pub bridge: &'static str,
}

/// Main sideloader instance (cloneable - all fields are Arc-wrapped)
///
/// Owns the persisted queue, the three pipeline stages and the single-flight
/// claim. Constructed once at process start with injected collaborators;
/// consumers subscribe to the event stream instead of polling.
#[derive(Clone)]
pub struct Sideloader {
    /// Persisted queue store, public for integration tests to inspect state
    pub store: Arc<QueueStore>,
    pub(crate) transfer: Arc<TransferStage>,
    pub(crate) extraction: Arc<ExtractionStage>,
    pub(crate) install: Arc<InstallStage>,
    pub(crate) bridge_name: &'static str,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) notifier: QueueNotifier,
    /// Device id this process is connection-bound to, when connected.
    /// Set by the external device-bridge collaborator, re-read before any
    /// device I/O, never cached across an await.
    pub(crate) connection: Arc<RwLock<Option<String>>>,
    pub(crate) slot: PipelineSlot,
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Runtime-mutable download root; applies to newly enqueued items
    pub(crate) download_dir: Arc<RwLock<PathBuf>>,
    pub(crate) delete_after_install: bool,
}

impl Sideloader {
    /// Create a new Sideloader instance
    ///
    /// This initializes all core components:
    /// - Ensures the download root exists
    /// - Loads the persisted queue, resetting items interrupted by a crash
    /// - Resolves transfer/extraction tooling for this environment
    /// - Sets up the event broadcast channel
    ///
    /// Any backlog recovered from the snapshot starts draining immediately.
    pub async fn new(config: Config, bridge: Arc<dyn DeviceBridge>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                )
            })?;

        let store = Arc::new(QueueStore::load(&config.persistence.queue_path).await);
        store.reset_interrupted().await?;

        // Buffered so slow subscribers don't stall the pipeline
        let (event_tx, _rx) = broadcast::channel(1024);
        let notifier = QueueNotifier::new(
            event_tx.clone(),
            Duration::from_millis(config.download.progress_debounce_ms),
        );

        let bridge_name = bridge.name();
        let sideloader = Self {
            store,
            transfer: Arc::new(TransferStage::new(&config)),
            extraction: Arc::new(ExtractionStage::new(&config)),
            install: Arc::new(InstallStage::new(bridge)),
            bridge_name,
            event_tx,
            notifier,
            connection: Arc::new(RwLock::new(None)),
            slot: PipelineSlot::new(),
            accepting_new: Arc::new(AtomicBool::new(true)),
            download_dir: Arc::new(RwLock::new(config.download.download_dir.clone())),
            delete_after_install: config.download.delete_after_install,
        };

        sideloader.kick();
        Ok(sideloader)
    }

    /// Subscribe to sideloader events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. Queue-changed notifications are coalesced to the
    /// configured debounce window.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Query what this environment can do
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            transport: self.transfer.mode(),
            resumable_downloads: self.transfer.resumable(),
            extraction_available: self.extraction.available(),
            bridge: self.bridge_name,
        }
    }

    /// Record the device this process is connection-bound to.
    ///
    /// Called by the external device-bridge collaborator when the user
    /// connects or disconnects a device. `connected = false` clears the
    /// binding regardless of the id passed.
    pub async fn set_connection_state(&self, device_id: Option<String>, connected: bool) {
        let mut binding = self.connection.write().await;
        *binding = if connected { device_id } else { None };
        tracing::info!(device = ?*binding, "Connection state updated");
    }

    /// Stop accepting new work and shut down the active stage, leaving the
    /// interrupted item's persisted status for restart recovery to requeue.
    pub async fn shutdown(&self) {
        self.accepting_new.store(false, Ordering::SeqCst);
        self.emit_event(Event::Shutdown);

        if let Some(holder) = self.slot.holder().await {
            self.transfer
                .request_abort(&holder, crate::transfer::AbortReason::Shutdown)
                .await;
            self.extraction.cancel(&holder).await;
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        !self.accepting_new.load(Ordering::SeqCst)
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// pipeline progress never depends on anyone listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.notifier.send_now(event);
    }
}
