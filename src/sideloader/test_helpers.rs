//! Shared fixtures for sideloader tests: a recording mock bridge, fake
//! transfer/archiver tool scripts, and fully wired test instances.

use crate::device::{DeviceBridge, DeviceInfo, DeviceState};
use crate::error::{InstallError, Result};
use crate::types::{ItemPatch, QueueItem, ReleaseId, Status};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Device bridge that records every call instead of touching a device
pub(crate) struct MockBridge {
    devices: Mutex<Vec<DeviceInfo>>,
    installs: Mutex<Vec<String>>,
    pushes: Mutex<Vec<(String, String)>>,
    fail_installs: AtomicBool,
}

impl MockBridge {
    pub(crate) fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            installs: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            fail_installs: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_device(id: &str) -> Self {
        let bridge = Self::new();
        bridge.connect_device(id);
        bridge
    }

    pub(crate) fn connect_device(&self, id: &str) {
        self.devices.lock().unwrap().push(DeviceInfo {
            id: id.to_string(),
            state: DeviceState::Device,
            model: Some("Quest_2".to_string()),
        });
    }

    pub(crate) fn disconnect_all(&self) {
        self.devices.lock().unwrap().clear();
    }

    pub(crate) fn set_fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    /// Apk paths passed to `install_package`, in call order
    pub(crate) fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }

    /// `(src, dst)` pairs passed to `push`, in call order
    pub(crate) fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for MockBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn install_package(&self, _device_id: &str, apk: &Path, _flags: &[&str]) -> Result<()> {
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(InstallError::InstallFailed("mock install failure".to_string()).into());
        }
        self.installs
            .lock()
            .unwrap()
            .push(apk.display().to_string());
        Ok(())
    }

    async fn push(&self, _device_id: &str, src: &Path, dst: &str) -> Result<()> {
        self.pushes
            .lock()
            .unwrap()
            .push((src.display().to_string(), dst.to_string()));
        Ok(())
    }

    async fn run_shell_command(&self, _device_id: &str, _cmd: &str) -> Result<String> {
        Ok(String::new())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Poll the store until the item reaches `status` or the timeout elapses
pub(crate) async fn wait_for_status(
    loader: &super::Sideloader,
    release_id: &ReleaseId,
    status: Status,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if loader.store.find(release_id).await.map(|item| item.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Sideloader with the driver parked, for state-machine tests that seed the
/// store directly. Built on the direct-HTTP transport so no tool binaries are
/// involved; the shutdown flag keeps the pipeline from claiming seeded items.
pub(crate) struct IdleHarness {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) bridge: Arc<MockBridge>,
    pub(crate) loader: super::Sideloader,
}

pub(crate) async fn idle_harness() -> IdleHarness {
    idle_harness_with(|_| {}).await
}

pub(crate) async fn idle_harness_with(
    configure: impl FnOnce(&mut crate::config::Config),
) -> IdleHarness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = crate::config::Config::default();
    config.download.download_dir = dir.path().join("downloads");
    config.download.progress_debounce_ms = 10;
    config.persistence.queue_path = dir.path().join("queue.json");
    config.tools.search_path = false;
    config.source.base_uri = "http://127.0.0.1:9/releases".to_string();
    configure(&mut config);

    let bridge = Arc::new(MockBridge::new());
    let loader = super::Sideloader::new(config, bridge.clone()).await.unwrap();
    loader
        .accepting_new
        .store(false, std::sync::atomic::Ordering::SeqCst);
    IdleHarness { dir, bridge, loader }
}

/// Insert an item directly into the store with the given status, bypassing
/// `add_to_queue` and the pipeline
pub(crate) async fn seed_item(
    loader: &super::Sideloader,
    release_id: &str,
    status: Status,
) -> ReleaseId {
    let id: ReleaseId = release_id.into();
    let download_path = loader.download_dir.read().await.join(release_id);
    let item = QueueItem::new(
        id.clone(),
        format!("com.example.{release_id}"),
        release_id,
        download_path,
    );
    loader.store.add(item).await.unwrap();

    let patch = if status.is_error_state() {
        ItemPatch::failure(status, "seeded failure")
    } else {
        ItemPatch::status(status)
    };
    loader.store.update(&id, patch).await.unwrap();
    id
}

#[cfg(unix)]
pub(crate) mod unix {
    use super::*;
    use crate::config::Config;
    use crate::sideloader::Sideloader;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Fake rclone: prints two stats lines, drops the archive into the
    /// destination directory (argv position 5) and appends the remote path to
    /// `order.log` next to the download root. Releases whose remote path
    /// contains `SLOW` hang so tests can cancel them.
    pub(crate) const TRANSFER_OK: &str = r#"
case "$4" in *SLOW*) sleep 30;; esac
DEST="$5"
echo 'Transferred: 1 MiB / 2 MiB, 50%, 1.0 MiB/s, ETA 1s' >&2
: > "$DEST/payload.7z"
echo "$4" >> "$DEST/../order.log"
echo 'Transferred: 2 MiB / 2 MiB, 100%, 2.0 MiB/s, ETA 0s' >&2
exit 0
"#;

    /// Fake transfer that always fails after some diagnostic output
    pub(crate) const TRANSFER_FAIL: &str = r#"
echo 'Failed to copy: connection reset by peer' >&2
exit 3
"#;

    /// Fake transfer that fails on the first attempt for a destination and
    /// succeeds on the next, for retry tests
    pub(crate) const TRANSFER_FAIL_ONCE: &str = r#"
DEST="$5"
if [ ! -e "$DEST/tried" ]; then
  : > "$DEST/tried"
  echo 'Failed to copy: connection reset by peer' >&2
  exit 3
fi
echo 'Transferred: 2 MiB / 2 MiB, 100%, 2.0 MiB/s, ETA 0s' >&2
: > "$DEST/payload.7z"
exit 0
"#;

    /// Fake 7z: prints percent steps and materializes an apk plus an OBB
    /// directory in the destination (the `-o<dir>` argument)
    pub(crate) const ARCHIVER_OK: &str = r#"
DEST="${3#-o}"
mkdir -p "$DEST"
echo ' 50%'
: > "$DEST/base.apk"
mkdir -p "$DEST/com.example.game"
echo '100%'
exit 0
"#;

    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Fully wired sideloader with fake tools and a mock bridge
    pub(crate) struct Harness {
        pub(crate) dir: tempfile::TempDir,
        pub(crate) bridge: Arc<MockBridge>,
        pub(crate) loader: Sideloader,
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(TRANSFER_OK, ARCHIVER_OK).await
    }

    pub(crate) async fn harness_with(transfer_body: &str, archiver_body: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), transfer_body, archiver_body);
        let bridge = Arc::new(MockBridge::new());
        let loader = Sideloader::new(config, bridge.clone()).await.unwrap();
        Harness { dir, bridge, loader }
    }

    pub(crate) fn test_config(root: &Path, transfer_body: &str, archiver_body: &str) -> Config {
        let mut config = Config::default();
        config.download.download_dir = root.join("downloads");
        config.download.progress_debounce_ms = 10;
        config.persistence.queue_path = root.join("queue.json");
        config.tools.rclone_path = Some(write_script(root, "rclone", transfer_body));
        config.tools.sevenzip_path = Some(write_script(root, "7z", archiver_body));
        config.tools.search_path = false;
        // Never contacted: the fake transfer tool ignores it
        config.source.base_uri = "http://127.0.0.1:1/releases".to_string();
        config
    }
}
