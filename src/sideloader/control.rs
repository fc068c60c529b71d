//! Item lifecycle control: cancel, retry, pause, resume.
//!
//! Every operation is a guarded state check followed by at most one kill
//! signal and one state update, idempotent when no matching process or state
//! exists. User actions can arrive at any time, racing the pipeline driver;
//! the stage workers own the final status transition whenever a process is
//! genuinely running.

use crate::error::{Error, Result};
use crate::transfer::AbortReason;
use crate::types::{ItemPatch, ReleaseId, Status};

use super::Sideloader;

impl Sideloader {
    /// Cancel an item on the user's request.
    ///
    /// Safe against any status: active stages get a kill signal and their
    /// worker confirms the transition; inactive items transition directly;
    /// terminal items are a no-op. Calling this twice is harmless.
    pub async fn cancel_user_request(&self, release_id: &ReleaseId) -> Result<()> {
        let item = self
            .store
            .find(release_id)
            .await
            .ok_or_else(|| Error::NotFound(release_id.to_string()))?;

        match item.status {
            Status::Downloading => {
                let signalled = self
                    .transfer
                    .request_abort(release_id, AbortReason::Cancelled)
                    .await;
                if !signalled {
                    // Tracked state already gone: the process exited but its
                    // final update lost the race. Transition directly.
                    self.store
                        .update(release_id, ItemPatch::status(Status::Cancelled))
                        .await?;
                    self.notifier.queue_changed();
                }
            }
            Status::Extracting => {
                let signalled = self.extraction.cancel(release_id).await;
                if !signalled {
                    self.store
                        .update(
                            release_id,
                            ItemPatch {
                                status: Some(Status::Cancelled),
                                extract_progress: Some(None),
                                ..ItemPatch::default()
                            },
                        )
                        .await?;
                    self.notifier.queue_changed();
                }
            }
            Status::Installing => {
                // The device-side install primitive cannot be killed mid
                // flight; mark the item and let the pipeline discard the
                // in-flight result.
                self.store
                    .update(release_id, ItemPatch::status(Status::Cancelled))
                    .await?;
                self.notifier.queue_changed();
            }
            Status::Queued | Status::Paused => {
                self.store
                    .update(release_id, ItemPatch::status(Status::Cancelled))
                    .await?;
                self.notifier.queue_changed();
            }
            Status::Completed | Status::Error | Status::InstallError | Status::Cancelled => {
                tracing::debug!(release_id = %release_id, status = %item.status, "Cancel is a no-op");
            }
        }
        Ok(())
    }

    /// Reset a failed or cancelled item back to Queued for another attempt.
    ///
    /// Progress and diagnostics are cleared; the pipeline picks the item up
    /// again in FIFO position. Retries are always user-initiated and
    /// uncapped.
    pub async fn retry_download(&self, release_id: &ReleaseId) -> Result<()> {
        let item = self
            .store
            .find(release_id)
            .await
            .ok_or_else(|| Error::NotFound(release_id.to_string()))?;

        if !item.status.is_retriable() {
            return Err(Error::InvalidState {
                release_id: release_id.to_string(),
                operation: "retry".to_string(),
                current_state: item.status.to_string(),
            });
        }

        self.store.update(release_id, ItemPatch::requeued()).await?;
        self.notifier.queue_changed();
        self.kick();
        Ok(())
    }

    /// Pause a download.
    ///
    /// An active transfer process is terminated but its partial data is kept;
    /// a queued item simply stops being eligible for the pipeline. Already
    /// paused items are a no-op.
    pub async fn pause_download(&self, release_id: &ReleaseId) -> Result<()> {
        let item = self
            .store
            .find(release_id)
            .await
            .ok_or_else(|| Error::NotFound(release_id.to_string()))?;

        match item.status {
            Status::Paused => Ok(()),
            Status::Downloading => {
                let signalled = self
                    .transfer
                    .request_abort(release_id, AbortReason::Paused)
                    .await;
                if !signalled {
                    self.store
                        .update(release_id, ItemPatch::status(Status::Paused))
                        .await?;
                    self.notifier.queue_changed();
                }
                Ok(())
            }
            Status::Queued => {
                self.store
                    .update(release_id, ItemPatch::status(Status::Paused))
                    .await?;
                self.notifier.queue_changed();
                Ok(())
            }
            Status::Extracting
            | Status::Installing
            | Status::Completed
            | Status::Error
            | Status::InstallError
            | Status::Cancelled => Err(Error::InvalidState {
                release_id: release_id.to_string(),
                operation: "pause".to_string(),
                current_state: item.status.to_string(),
            }),
        }
    }

    /// Resume a paused download.
    ///
    /// The item re-enters the queue with the same destination, so the
    /// remote-copy transport continues from partial data. The direct-HTTP
    /// fallback cannot resume; its progress restarts from zero.
    pub async fn resume_download(&self, release_id: &ReleaseId) -> Result<()> {
        let item = self
            .store
            .find(release_id)
            .await
            .ok_or_else(|| Error::NotFound(release_id.to_string()))?;

        match item.status {
            Status::Paused => {
                let mut patch = ItemPatch::status(Status::Queued);
                if !self.transfer.resumable() {
                    tracing::warn!(
                        release_id = %release_id,
                        "Direct-HTTP transport cannot resume, download restarts from zero"
                    );
                    patch.progress = Some(0.0);
                }
                self.store.update(release_id, patch).await?;
                self.notifier.queue_changed();
                self.kick();
                Ok(())
            }
            // Already somewhere in the pipeline: nothing to do
            Status::Queued | Status::Downloading | Status::Extracting | Status::Installing => {
                Ok(())
            }
            Status::Completed | Status::Error | Status::InstallError | Status::Cancelled => {
                Err(Error::InvalidState {
                    release_id: release_id.to_string(),
                    operation: "resume".to_string(),
                    current_state: item.status.to_string(),
                })
            }
        }
    }
}
