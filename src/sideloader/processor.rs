//! Single-flight pipeline driver
//!
//! One item at a time moves through Download → Extraction → Installation.
//! The claim is an explicit lease (the active release id), the single source
//! of truth for "is the slot taken". A driver finding the lease held with no
//! stage actually active releases it and retries, so a missed callback can
//! never deadlock the queue. Every exit path falls through to claiming the
//! next item, draining the backlog without external prompting.

use super::Sideloader;
use crate::error::Result;
use crate::extraction::ExtractionOutcome;
use crate::transfer::{AbortReason, TransferOutcome};
use crate::types::{Event, ItemPatch, QueueItem, ReleaseId, Status};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A claim younger than this may still be between claiming and registering
/// with its first stage; the stale check leaves it alone.
const STALE_CLAIM_GRACE: Duration = Duration::from_secs(1);

struct Claim {
    holder: ReleaseId,
    claimed_at: Instant,
}

/// Explicit single-flight lease over the pipeline
#[derive(Clone)]
pub(crate) struct PipelineSlot {
    inner: Arc<Mutex<Option<Claim>>>,
}

impl PipelineSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Claim the slot for an item. Fails if any claim is held.
    pub(crate) async fn try_claim(&self, holder: ReleaseId) -> bool {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(Claim {
            holder,
            claimed_at: Instant::now(),
        });
        true
    }

    /// Current claim holder, if any
    pub(crate) async fn holder(&self) -> Option<ReleaseId> {
        self.inner.lock().await.as_ref().map(|claim| claim.holder.clone())
    }

    /// Current claim holder plus how long it has been held
    pub(crate) async fn holder_age(&self) -> Option<(ReleaseId, Duration)> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|claim| (claim.holder.clone(), claim.claimed_at.elapsed()))
    }

    /// Release the slot if `holder` still owns it
    pub(crate) async fn release(&self, holder: &ReleaseId) -> bool {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(|claim| &claim.holder == holder) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

impl Sideloader {
    /// Wake the pipeline driver. Cheap and safe to call from any mutation;
    /// a driver that finds the slot legitimately busy simply exits.
    pub(crate) fn kick(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.process_queue().await });
    }

    async fn process_queue(&self) {
        loop {
            if self.is_shutting_down() {
                return;
            }

            // Self-healing check: a held lease with no stage active is a
            // leftover from a missed callback, not a running pipeline.
            if let Some((holder, age)) = self.slot.holder_age().await {
                let busy = self.transfer.is_active(&holder).await
                    || self.extraction.is_active(&holder).await
                    || self.install.is_active(&holder).await;
                if busy || age < STALE_CLAIM_GRACE {
                    return;
                }
                tracing::warn!(release_id = %holder, "Releasing stale pipeline claim");
                self.slot.release(&holder).await;
                continue;
            }

            let Some(item) = self.store.find_next_queued().await else {
                return;
            };
            if !self.slot.try_claim(item.release_id.clone()).await {
                continue;
            }

            // One item's failure never stops the queue: anything that escapes
            // the stage handlers marks the item and moves on.
            if let Err(e) = self.run_item(&item).await {
                tracing::error!(
                    release_id = %item.release_id,
                    error = %e,
                    "Pipeline error, marking item failed"
                );
                self.store
                    .update(
                        &item.release_id,
                        ItemPatch::failure(Status::Error, e.to_string()),
                    )
                    .await
                    .ok();
                self.notifier.queue_changed();
            }
            self.slot.release(&item.release_id).await;
        }
    }

    /// Record the stage process pid, unless the item already left its active
    /// status (the process can exit before this update is scheduled).
    async fn record_stage_pid(&self, id: &ReleaseId, pid: u32) {
        let still_active = self
            .store
            .find(id)
            .await
            .is_some_and(|item| item.status.is_active());
        if !still_active {
            return;
        }
        self.store
            .update(
                id,
                ItemPatch {
                    process_pid: Some(Some(pid)),
                    ..ItemPatch::default()
                },
            )
            .await
            .ok();
    }

    async fn run_item(&self, item: &QueueItem) -> Result<()> {
        tracing::info!(release_id = %item.release_id, name = %item.display_name, "Pipeline claimed item");

        if !self.run_download(item).await? {
            return Ok(());
        }
        if !self.run_extraction(item).await? {
            return Ok(());
        }
        self.maybe_install(item).await
    }

    /// Download stage. Returns whether the chain continues.
    async fn run_download(&self, item: &QueueItem) -> Result<bool> {
        let id = item.release_id.clone();
        self.store
            .update(&id, ItemPatch::status(Status::Downloading))
            .await?;
        self.notifier.queue_changed();

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let updater = {
            let this = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(update) = progress_rx.recv().await {
                    let update: crate::types::TransferProgress = update;
                    this.store
                        .update(
                            &id,
                            ItemPatch {
                                progress: Some(update.percent),
                                speed_bps: Some(update.speed_bps),
                                eta_seconds: Some(update.eta_seconds),
                                ..ItemPatch::default()
                            },
                        )
                        .await
                        .ok();
                    this.notifier.queue_changed();
                }
            })
        };

        let on_spawned = {
            let this = self.clone();
            let id = id.clone();
            move |pid: Option<u32>| {
                if let Some(pid) = pid {
                    tokio::spawn(async move { this.record_stage_pid(&id, pid).await });
                }
            }
        };

        let outcome = self
            .transfer
            .run(item, on_spawned, move |update| {
                progress_tx.send(update).ok();
            })
            .await;
        updater.await.ok();

        let proceed = match outcome {
            TransferOutcome::Completed => true,
            TransferOutcome::SpawnFailed(detail) => {
                self.store
                    .update(
                        &id,
                        ItemPatch::failure(
                            Status::Error,
                            format!("failed to start transfer: {detail}"),
                        ),
                    )
                    .await?;
                false
            }
            TransferOutcome::Failed { code, detail } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                self.store
                    .update(
                        &id,
                        ItemPatch::failure(
                            Status::Error,
                            format!("transfer failed (exit {code}): {detail}"),
                        ),
                    )
                    .await?;
                false
            }
            TransferOutcome::Aborted(AbortReason::Cancelled) => {
                self.store
                    .update(&id, ItemPatch::status(Status::Cancelled))
                    .await?;
                false
            }
            TransferOutcome::Aborted(AbortReason::Paused) => {
                self.store
                    .update(&id, ItemPatch::status(Status::Paused))
                    .await?;
                false
            }
            TransferOutcome::Aborted(AbortReason::Error(message)) => {
                self.store
                    .update(&id, ItemPatch::failure(Status::Error, message))
                    .await?;
                false
            }
            // Persisted status stays Downloading; restart recovery requeues it
            TransferOutcome::Aborted(AbortReason::Shutdown) => false,
        };
        self.notifier.queue_changed();
        Ok(proceed)
    }

    /// Extraction stage. Returns whether the chain continues.
    async fn run_extraction(&self, item: &QueueItem) -> Result<bool> {
        let id = item.release_id.clone();

        if !self.extraction.available() {
            self.store
                .update(&id, ItemPatch::failure(Status::Error, "archiver tool not available"))
                .await?;
            self.notifier.queue_changed();
            return Ok(false);
        }

        self.store
            .update(
                &id,
                ItemPatch {
                    status: Some(Status::Extracting),
                    extract_progress: Some(Some(0.0)),
                    ..ItemPatch::default()
                },
            )
            .await?;
        self.notifier.queue_changed();

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let updater = {
            let this = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(percent) = progress_rx.recv().await {
                    this.store
                        .update(
                            &id,
                            ItemPatch {
                                extract_progress: Some(Some(percent)),
                                ..ItemPatch::default()
                            },
                        )
                        .await
                        .ok();
                    this.notifier.queue_changed();
                }
            })
        };

        let on_spawned = {
            let this = self.clone();
            let id = id.clone();
            move |pid: Option<u32>| {
                if let Some(pid) = pid {
                    tokio::spawn(async move { this.record_stage_pid(&id, pid).await });
                }
            }
        };

        let outcome = self
            .extraction
            .run(&id, &item.download_path, on_spawned, move |percent| {
                progress_tx.send(percent).ok();
            })
            .await;
        updater.await.ok();

        let proceed = match outcome {
            ExtractionOutcome::Completed => {
                self.store
                    .update(
                        &id,
                        ItemPatch {
                            status: Some(Status::Completed),
                            extract_progress: Some(Some(100.0)),
                            ..ItemPatch::default()
                        },
                    )
                    .await?;
                true
            }
            ExtractionOutcome::SpawnFailed(detail) => {
                self.store
                    .update(
                        &id,
                        ItemPatch::failure(
                            Status::Error,
                            format!("failed to start archiver: {detail}"),
                        ),
                    )
                    .await?;
                false
            }
            ExtractionOutcome::Failed { code, detail } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                self.store
                    .update(
                        &id,
                        ItemPatch::failure(
                            Status::Error,
                            format!("extraction failed (exit {code}): {detail}"),
                        ),
                    )
                    .await?;
                false
            }
            ExtractionOutcome::Aborted => {
                if !self.is_shutting_down() {
                    self.store
                        .update(
                            &id,
                            ItemPatch {
                                status: Some(Status::Cancelled),
                                extract_progress: Some(None),
                                ..ItemPatch::default()
                            },
                        )
                        .await?;
                }
                false
            }
        };
        self.notifier.queue_changed();
        Ok(proceed)
    }

    /// Installation gate after extraction success.
    ///
    /// The binding is re-read here, not carried from pipeline start:
    /// connectivity can change mid-pipeline. A missing or unavailable device
    /// skips installation and leaves the item `Completed`, installable later
    /// via the explicit entry point.
    async fn maybe_install(&self, item: &QueueItem) -> Result<()> {
        let bound = self.connection.read().await.clone();
        let Some(device) = bound else {
            tracing::debug!(release_id = %item.release_id, "No device bound, item stays installable");
            return Ok(());
        };
        if let Err(e) = self.install.verify_device(&device).await {
            tracing::warn!(
                release_id = %item.release_id,
                device = %device,
                error = %e,
                "Bound device unavailable, skipping installation"
            );
            return Ok(());
        }
        self.run_install_phase(&item.release_id, &item.download_path, &device)
            .await
    }

    /// Shared install phase used by the pipeline and the explicit
    /// install-from-completed entry point.
    pub(crate) async fn run_install_phase(
        &self,
        id: &ReleaseId,
        download_path: &Path,
        device: &str,
    ) -> Result<()> {
        self.store
            .update(id, ItemPatch::status(Status::Installing))
            .await?;
        self.notifier.queue_changed();

        let result = self.install.install_item(id, download_path, device).await;

        // The user may have cancelled while install I/O was in flight; never
        // overwrite a status another writer changed under us.
        let still_installing = self
            .store
            .find(id)
            .await
            .is_some_and(|current| current.status == Status::Installing);
        if !still_installing {
            tracing::warn!(release_id = %id, "Status changed during install, result discarded");
            return Ok(());
        }

        match result {
            Ok(()) => {
                self.store
                    .update(id, ItemPatch::status(Status::Completed))
                    .await?;
                self.emit_event(Event::InstallationSuccess {
                    device: device.to_string(),
                    release_id: id.clone(),
                });
                self.notifier.queue_changed();
                tracing::info!(release_id = %id, device = device, "Installation succeeded");

                if self.delete_after_install && !self.delete_downloaded_files(id).await? {
                    tracing::warn!(release_id = %id, "Post-install cleanup failed");
                }
                Ok(())
            }
            Err(e) => {
                self.store
                    .update(id, ItemPatch::failure(Status::InstallError, e.to_string()))
                    .await?;
                self.notifier.queue_changed();
                Ok(())
            }
        }
    }
}
