//! Persisted queue store
//!
//! Durable mapping of release id to queue item. The whole queue is kept in
//! memory and written back as one flat JSON list after every mutation, with an
//! atomic temp-file-and-rename replace. Corruption on load never crashes the
//! process: the store falls back to an empty queue and logs.

use crate::error::{Result, StoreError};
use crate::types::{ItemPatch, QueueItem, ReleaseId};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Flat-file queue store with load-all / save-all semantics
pub struct QueueStore {
    path: PathBuf,
    items: Mutex<Vec<QueueItem>>,
}

impl QueueStore {
    /// Open the store, loading any existing snapshot.
    ///
    /// A missing file yields an empty queue. A corrupt file is logged and
    /// treated as empty rather than failing startup.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<QueueItem>>(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Queue file is corrupt, starting with an empty queue"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Queue file is unreadable, starting with an empty queue"
                );
                Vec::new()
            }
        };

        tracing::debug!(path = %path.display(), count = items.len(), "Queue store loaded");

        Self {
            path,
            items: Mutex::new(items),
        }
    }

    /// Persist the current queue as one atomic file replace
    async fn save_locked(&self, items: &[QueueItem]) -> Result<()> {
        let json = serde_json::to_vec_pretty(items)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::WriteFailed {
                    path: self.path.clone(),
                    reason: format!("creating parent directory: {e}"),
                }
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: self.path.clone(),
                reason: format!("atomic rename: {e}"),
            })?;

        Ok(())
    }

    /// Snapshot of every item, in insertion order
    pub async fn get_all(&self) -> Vec<QueueItem> {
        self.items.lock().await.clone()
    }

    /// Look up one item by release id
    pub async fn find(&self, release_id: &ReleaseId) -> Option<QueueItem> {
        self.items
            .lock()
            .await
            .iter()
            .find(|item| &item.release_id == release_id)
            .cloned()
    }

    /// Add a new item. Fails with [`StoreError::Duplicate`] if the release id
    /// is already present.
    pub async fn add(&self, item: QueueItem) -> Result<()> {
        let mut items = self.items.lock().await;
        if items.iter().any(|existing| existing.release_id == item.release_id) {
            return Err(StoreError::Duplicate(item.release_id.to_string()).into());
        }
        items.push(item);
        self.save_locked(&items).await
    }

    /// Remove an item. Returns whether it existed.
    pub async fn remove(&self, release_id: &ReleaseId) -> Result<bool> {
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|item| &item.release_id != release_id);
        if items.len() == before {
            return Ok(false);
        }
        self.save_locked(&items).await?;
        Ok(true)
    }

    /// Apply a partial update to one item. Returns whether it existed.
    pub async fn update(&self, release_id: &ReleaseId, patch: ItemPatch) -> Result<bool> {
        let mut items = self.items.lock().await;
        let Some(item) = items
            .iter_mut()
            .find(|item| &item.release_id == release_id)
        else {
            return Ok(false);
        };
        item.apply(patch);
        self.save_locked(&items).await?;
        Ok(true)
    }

    /// Apply the same partial update to every item matching the predicate.
    /// Returns how many items were touched.
    pub async fn update_all_matching(
        &self,
        predicate: impl Fn(&QueueItem) -> bool,
        patch: ItemPatch,
    ) -> Result<usize> {
        let mut items = self.items.lock().await;
        let mut touched = 0;
        for item in items.iter_mut().filter(|item| predicate(item)) {
            item.apply(patch.clone());
            touched += 1;
        }
        if touched > 0 {
            self.save_locked(&items).await?;
        }
        Ok(touched)
    }

    /// The earliest-added item still waiting for the pipeline slot
    pub async fn find_next_queued(&self) -> Option<QueueItem> {
        self.items
            .lock()
            .await
            .iter()
            .filter(|item| item.status == crate::types::Status::Queued)
            .min_by_key(|item| item.added_at)
            .cloned()
    }

    /// Reset any item left in an active status by a previous session.
    ///
    /// Active statuses cannot survive a restart: the process that owned them
    /// is gone. Affected items go back to Queued with progress fields cleared.
    /// Returns how many items were reset.
    pub async fn reset_interrupted(&self) -> Result<usize> {
        let reset = self
            .update_all_matching(|item| item.status.is_active(), ItemPatch::requeued())
            .await?;
        if reset > 0 {
            tracing::info!(count = reset, "Reset interrupted items back to Queued");
        }
        Ok(reset)
    }

    /// Path of the backing snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
