//! Common test utilities for sideload-dl integration tests

use async_trait::async_trait;
use sideload_dl::{
    Config, DeviceBridge, DeviceInfo, DeviceState, InstallError, ReleaseId, Result, Sideloader,
    Status,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Device bridge that records calls instead of touching hardware
pub struct RecordingBridge {
    devices: Mutex<Vec<DeviceInfo>>,
    installs: Mutex<Vec<String>>,
    pushes: Mutex<Vec<(String, String)>>,
    fail_installs: AtomicBool,
}

#[allow(dead_code)]
impl RecordingBridge {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            installs: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            fail_installs: AtomicBool::new(false),
        }
    }

    pub fn connect_device(&self, id: &str) {
        self.devices.lock().unwrap().push(DeviceInfo {
            id: id.to_string(),
            state: DeviceState::Device,
            model: None,
        });
    }

    pub fn set_fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    pub fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for RecordingBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn install_package(&self, _device_id: &str, apk: &Path, _flags: &[&str]) -> Result<()> {
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(InstallError::InstallFailed("recorded install failure".to_string()).into());
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
        "recording"
    }
}

/// Fake 7z used for the extraction stage: prints percent steps and
/// materializes an apk plus an OBB directory in the `-o<dir>` destination
#[cfg(unix)]
pub const FAKE_ARCHIVER: &str = r#"
DEST="${3#-o}"
mkdir -p "$DEST"
echo ' 50%'
: > "$DEST/base.apk"
mkdir -p "$DEST/com.example.game"
echo '100%'
exit 0
"#;

#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config wired for the direct-HTTP fallback transport against a local mock
/// server, with the fake archiver standing in for 7z
#[cfg(unix)]
pub fn http_fallback_config(root: &Path, base_uri: &str) -> Config {
    let mut config = Config::default();
    config.download.download_dir = root.join("downloads");
    config.download.progress_debounce_ms = 10;
    config.persistence.queue_path = root.join("queue.json");
    config.tools.sevenzip_path = Some(write_script(root, "7z", FAKE_ARCHIVER));
    config.tools.search_path = false;
    config.source.base_uri = base_uri.to_string();
    config
}

/// Poll the queue until the item reaches `status` or the timeout elapses
#[allow(dead_code)]
pub async fn wait_for_status(
    loader: &Sideloader,
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
