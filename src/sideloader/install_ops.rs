//! Installation entry points outside the pipeline's own install phase.
//!
//! These bypass the single-flight claim: installing an already-completed item
//! or a manually supplied file is device I/O only, with no transfer or
//! extraction to serialize. Callers are responsible for not racing an ad hoc
//! install against a queue item processing on the same device.

use crate::error::{Error, InstallError, Result};
use crate::types::{Event, ReleaseId, Status};
use std::path::Path;

use super::Sideloader;

impl Sideloader {
    /// Install an already-completed queue item on the bound device.
    ///
    /// Used when an item finished while no device was connected, or to
    /// reinstall onto a newly bound device.
    pub async fn install_from_completed(
        &self,
        release_id: &ReleaseId,
        device_id: &str,
    ) -> Result<()> {
        let item = self
            .store
            .find(release_id)
            .await
            .ok_or_else(|| Error::NotFound(release_id.to_string()))?;

        if item.status != Status::Completed {
            return Err(Error::InvalidState {
                release_id: release_id.to_string(),
                operation: "install".to_string(),
                current_state: item.status.to_string(),
            });
        }

        self.check_binding(device_id).await?;
        self.run_install_phase(release_id, &item.download_path, device_id)
            .await
    }

    /// Ad hoc entry point: install a manually supplied apk file.
    ///
    /// Returns `false` on any precondition or install failure; ad hoc callers
    /// get a yes/no, not an error to unwind.
    pub async fn install_manual_file(&self, apk: &Path, device_id: &str) -> bool {
        if let Err(e) = self.check_binding(device_id).await {
            tracing::warn!(path = %apk.display(), error = %e, "Manual install rejected");
            return false;
        }
        match self.install.install_file(apk, device_id).await {
            Ok(()) => {
                self.emit_event(Event::InstallationSuccess {
                    device: device_id.to_string(),
                    release_id: manual_release_id(apk),
                });
                true
            }
            Err(e) => {
                tracing::warn!(path = %apk.display(), error = %e, "Manual install failed");
                false
            }
        }
    }

    /// Ad hoc entry point: copy an OBB folder to the device's OBB root.
    ///
    /// Returns `false` on any precondition or push failure.
    pub async fn copy_obb_folder(&self, folder: &Path, device_id: &str) -> bool {
        if let Err(e) = self.check_binding(device_id).await {
            tracing::warn!(path = %folder.display(), error = %e, "OBB copy rejected");
            return false;
        }
        match self.install.copy_obb(folder, device_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %folder.display(), error = %e, "OBB copy failed");
                false
            }
        }
    }

    /// Enforce the connection-binding preconditions before any device I/O:
    /// the process must be bound to exactly one device and the caller's
    /// target must be that device. The bridge independently re-confirms
    /// presence inside the install stage.
    pub(crate) async fn check_binding(&self, device_id: &str) -> Result<()> {
        let bound = self.connection.read().await.clone();
        match bound {
            None => Err(InstallError::NoDevice.into()),
            Some(bound) if bound != device_id => Err(InstallError::DeviceMismatch {
                requested: device_id.to_string(),
                bound,
            }
            .into()),
            Some(_) => Ok(()),
        }
    }
}

/// Identifier used in success events for installs not tied to a queue item
fn manual_release_id(apk: &Path) -> ReleaseId {
    apk.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("manual-install")
        .into()
}
