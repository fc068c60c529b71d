//! Queue inspection and mutation: enqueue, remove, delete artifacts, stats.

use crate::error::{Error, Result};
use crate::transfer::AbortReason;
use crate::types::{QueueItem, QueueStats, ReleaseId, Status};
use std::path::PathBuf;

use super::Sideloader;

impl Sideloader {
    /// Snapshot of the queue, ordered by when items were added
    pub async fn get_queue(&self) -> Vec<QueueItem> {
        let mut items = self.store.get_all().await;
        items.sort_by_key(|item| item.added_at);
        items
    }

    /// Per-status counts over the whole queue
    pub async fn queue_stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for item in self.store.get_all().await {
            stats.total += 1;
            match item.status {
                Status::Queued => stats.queued += 1,
                Status::Downloading => stats.downloading += 1,
                Status::Paused => stats.paused += 1,
                Status::Extracting => stats.extracting += 1,
                Status::Installing => stats.installing += 1,
                Status::Completed => stats.completed += 1,
                Status::Error | Status::InstallError => stats.failed += 1,
                Status::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Enqueue a release for download, extraction and installation.
    ///
    /// Returns `false` without touching the queue when the release is already
    /// present in a live or completed state. A previous `Error`/`Cancelled`
    /// record for the same release is replaced by the fresh item.
    pub async fn add_to_queue(
        &self,
        release_id: impl Into<ReleaseId>,
        package_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<bool> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let release_id = release_id.into();

        if let Some(existing) = self.store.find(&release_id).await {
            if !existing.status.is_replaceable() {
                tracing::debug!(
                    release_id = %release_id,
                    status = %existing.status,
                    "Enqueue rejected, release already present"
                );
                return Ok(false);
            }
            self.store.remove(&release_id).await?;
        }

        let download_path = self.download_dir.read().await.join(release_id.as_str());
        let item = QueueItem::new(release_id, package_id, display_name, download_path);
        tracing::info!(release_id = %item.release_id, name = %item.display_name, "Enqueued");
        self.store.add(item).await?;

        self.notifier.queue_changed();
        self.kick();
        Ok(true)
    }

    /// Remove an item from the queue, killing its stage process if one is
    /// running. The item's on-disk artifacts are left alone; use
    /// [`delete_downloaded_files`](Self::delete_downloaded_files) to drop
    /// both.
    pub async fn remove_from_queue(&self, release_id: &ReleaseId) -> Result<()> {
        let item = self
            .store
            .find(release_id)
            .await
            .ok_or_else(|| Error::NotFound(release_id.to_string()))?;

        match item.status {
            Status::Downloading => {
                self.transfer
                    .request_abort(release_id, AbortReason::Cancelled)
                    .await;
            }
            Status::Extracting => {
                self.extraction.cancel(release_id).await;
            }
            _ => {}
        }

        self.store.remove(release_id).await?;
        self.notifier.queue_changed();
        Ok(())
    }

    /// Delete an item's downloaded artifacts and drop its record.
    ///
    /// Returns `false` when the item is unknown, currently owned by a stage,
    /// or its directory could not be removed.
    pub async fn delete_downloaded_files(&self, release_id: &ReleaseId) -> Result<bool> {
        let Some(item) = self.store.find(release_id).await else {
            return Ok(false);
        };
        if item.status.is_active() {
            tracing::warn!(
                release_id = %release_id,
                status = %item.status,
                "Refusing to delete files while a stage owns the item"
            );
            return Ok(false);
        }

        match tokio::fs::remove_dir_all(&item.download_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    release_id = %release_id,
                    path = %item.download_path.display(),
                    error = %e,
                    "Failed to delete downloaded files"
                );
                return Ok(false);
            }
        }

        self.store.remove(release_id).await?;
        self.notifier.queue_changed();
        Ok(true)
    }

    /// Point newly enqueued items at a different download root.
    ///
    /// Items already in the queue keep the directory they were created with.
    pub async fn set_download_path(&self, path: PathBuf) {
        tracing::info!(path = %path.display(), "Download root updated");
        *self.download_dir.write().await = path;
    }
}
