//! Installation stage: deliver an extracted payload to a connected device
//!
//! Locates the installable file under an item's directory, invokes the
//! device-bridge install primitive with reinstall/grant-permissions flags and
//! pushes auxiliary OBB data afterward. All device preconditions are enforced
//! before any device I/O. Also hosts the ad hoc entry points (manual apk
//! install, OBB folder copy) that bypass the queue.

use crate::device::DeviceBridge;
use crate::error::{Error, InstallError, Result};
use crate::types::ReleaseId;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Device-side root for auxiliary expansion data
const OBB_ROOT: &str = "/sdcard/Android/obb";

/// Install flags: reinstall over an existing package, grant all runtime
/// permissions up front
const INSTALL_FLAGS: [&str; 2] = ["-r", "-g"];

/// Payload discovered under an item's directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    /// The installable package file
    pub apk: PathBuf,
    /// Package-named data directories to copy to the device's OBB root
    pub obb_dirs: Vec<PathBuf>,
}

/// Runs device installs through the injected bridge
pub struct InstallStage {
    bridge: Arc<dyn DeviceBridge>,
    active: Arc<Mutex<HashSet<ReleaseId>>>,
}

impl InstallStage {
    /// Create the stage around a bridge implementation
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            bridge,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether an install for this release is in flight right now
    pub async fn is_active(&self, release_id: &ReleaseId) -> bool {
        self.active.lock().await.contains(release_id)
    }

    /// Confirm the device is still present and authorized via the bridge.
    ///
    /// Connectivity can change at any moment; callers re-run this immediately
    /// before install I/O rather than trusting an earlier answer.
    pub async fn verify_device(&self, device_id: &str) -> Result<()> {
        let devices = self.bridge.list_devices().await?;
        let usable = devices
            .iter()
            .any(|device| device.id == device_id && device.is_usable());
        if !usable {
            return Err(InstallError::DeviceGone(device_id.to_string()).into());
        }
        Ok(())
    }

    /// Install a queue item's extracted payload on the device.
    ///
    /// The caller has already validated the connection binding; this method
    /// re-confirms device presence, installs, then pushes auxiliary data.
    pub async fn install_item(
        &self,
        release_id: &ReleaseId,
        download_path: &Path,
        device_id: &str,
    ) -> Result<()> {
        self.active.lock().await.insert(release_id.clone());
        let result = self.install_payload(download_path, device_id).await;
        self.active.lock().await.remove(release_id);
        result
    }

    async fn install_payload(&self, download_path: &Path, device_id: &str) -> Result<()> {
        self.verify_device(device_id).await?;
        let payload = locate_payload(download_path).await?;

        tracing::info!(
            device = device_id,
            apk = %payload.apk.display(),
            obb_dirs = payload.obb_dirs.len(),
            "Installing payload"
        );
        self.bridge
            .install_package(device_id, &payload.apk, &INSTALL_FLAGS)
            .await?;

        for obb_dir in &payload.obb_dirs {
            let Some(name) = obb_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            self.bridge
                .push(device_id, obb_dir, &format!("{OBB_ROOT}/{name}"))
                .await?;
        }
        Ok(())
    }

    /// Ad hoc entry point: install a manually supplied apk file.
    ///
    /// Bypasses the queue and its single-flight claim; the caller must not
    /// race this against a queue item processing on the same device.
    pub async fn install_file(&self, apk: &Path, device_id: &str) -> Result<()> {
        if !is_apk(apk) || !apk.is_file() {
            return Err(InstallError::NoPayload(apk.to_path_buf()).into());
        }
        self.verify_device(device_id).await?;
        self.bridge
            .install_package(device_id, apk, &INSTALL_FLAGS)
            .await
    }

    /// Ad hoc entry point: copy an OBB folder to the device's OBB root.
    pub async fn copy_obb(&self, folder: &Path, device_id: &str) -> Result<()> {
        if !folder.is_dir() {
            return Err(InstallError::NoPayload(folder.to_path_buf()).into());
        }
        let Some(name) = folder.file_name().and_then(|n| n.to_str()) else {
            return Err(InstallError::NoPayload(folder.to_path_buf()).into());
        };
        self.verify_device(device_id).await?;
        self.bridge
            .push(device_id, folder, &format!("{OBB_ROOT}/{name}"))
            .await
    }
}

fn is_apk(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
}

/// Locate the installable payload under an item's directory.
///
/// The apk may sit at the top level or one directory down (archives often
/// wrap their content in a single folder). Auxiliary data is any
/// package-named directory (`com.vendor.title` style) next to the apk.
pub async fn locate_payload(dir: &Path) -> Result<Payload> {
    if let Some(payload) = scan_dir(dir).await? {
        return Ok(payload);
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|_| Error::Install(InstallError::NoPayload(dir.to_path_buf())))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_dir()
            && let Some(payload) = scan_dir(&path).await?
        {
            return Ok(payload);
        }
    }

    Err(InstallError::NoPayload(dir.to_path_buf()).into())
}

/// One-level scan: first apk file wins, package-named sibling dirs become OBB
/// candidates.
async fn scan_dir(dir: &Path) -> Result<Option<Payload>> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Ok(None);
    };
    let mut apks = Vec::new();
    let mut obb_dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_file() && is_apk(&path) {
            apks.push(path);
        } else if path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains('.'))
        {
            obb_dirs.push(path);
        }
    }
    apks.sort();
    obb_dirs.sort();
    Ok(apks.into_iter().next().map(|apk| Payload { apk, obb_dirs }))
}
