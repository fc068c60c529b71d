//! Device-bridge interface and adb-backed implementation
//!
//! The sideloader consumes device discovery, install, push and shell
//! primitives through the [`DeviceBridge`] trait so tests can substitute a
//! mock and alternative bridge tools can be plugged in. [`AdbBridge`] executes
//! the external `adb` binary.

use crate::error::{Error, InstallError, Result, bounded_diagnostic};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Connection state of a discovered device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Connected and authorized
    Device,
    /// Connected but the user has not accepted the debug prompt
    Unauthorized,
    /// Known to adb but unreachable
    Offline,
}

/// One device visible to the bridge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device serial / identifier
    pub id: String,
    /// Authorization state
    pub state: DeviceState,
    /// Model name, when the bridge reports one
    pub model: Option<String>,
}

impl DeviceInfo {
    /// Whether this device can accept installs right now
    pub fn is_usable(&self) -> bool {
        self.state == DeviceState::Device
    }
}

/// Device discovery, push, shell and install primitives
///
/// Implementations must be safe to call concurrently; each method is one
/// self-contained bridge invocation.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// List devices currently visible to the bridge
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Install a package file on a device
    async fn install_package(&self, device_id: &str, apk: &Path, flags: &[&str]) -> Result<()>;

    /// Push a file or folder to a device-side path
    async fn push(&self, device_id: &str, src: &Path, dst: &str) -> Result<()>;

    /// Run a shell command on the device, returning its stdout
    async fn run_shell_command(&self, device_id: &str, cmd: &str) -> Result<String>;

    /// Bridge implementation name, for logs
    fn name(&self) -> &'static str;
}

/// CLI bridge executing the external `adb` binary
pub struct AdbBridge {
    binary_path: PathBuf,
}

impl AdbBridge {
    /// Create a new bridge with an explicit adb path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find adb in PATH
    pub fn from_path() -> Option<Self> {
        which::which("adb").ok().map(Self::new)
    }

    async fn exec(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.binary_path)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("Failed to execute adb: {e}")))
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let output = self.exec(&["devices", "-l"]).await?;
        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "adb devices failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_devices_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn install_package(&self, device_id: &str, apk: &Path, flags: &[&str]) -> Result<()> {
        let apk_str = apk.to_string_lossy();
        let mut args = vec!["-s", device_id, "install"];
        args.extend_from_slice(flags);
        args.push(&apk_str);

        let output = self.exec(&args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        // adb historically exits 0 on some install failures; the textual
        // "Failure [...]" marker is the reliable signal
        if !output.status.success() || stdout.contains("Failure") || stderr.contains("Failure") {
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(InstallError::InstallFailed(bounded_diagnostic(detail.trim())).into());
        }
        Ok(())
    }

    async fn push(&self, device_id: &str, src: &Path, dst: &str) -> Result<()> {
        let src_str = src.to_string_lossy();
        let output = self.exec(&["-s", device_id, "push", &src_str, dst]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstallError::PushFailed(bounded_diagnostic(stderr.trim())).into());
        }
        Ok(())
    }

    async fn run_shell_command(&self, device_id: &str, cmd: &str) -> Result<String> {
        let output = self.exec(&["-s", device_id, "shell", cmd]).await?;
        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "adb shell {cmd:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn name(&self) -> &'static str {
        "cli-adb"
    }
}

/// Parse `adb devices -l` output into structured device records.
///
/// Narrow contract, no process involved; unit-testable in isolation.
pub fn parse_devices_output(output: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices") || line.starts_with('*') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(id) = fields.next() else { continue };
        let Some(state_token) = fields.next() else { continue };
        let state = match state_token {
            "device" => DeviceState::Device,
            "unauthorized" => DeviceState::Unauthorized,
            "offline" => DeviceState::Offline,
            _ => continue,
        };
        let model = fields
            .find_map(|field| field.strip_prefix("model:"))
            .map(str::to_string);
        devices.push(DeviceInfo {
            id: id.to_string(),
            state,
            model,
        });
    }
    devices
}
