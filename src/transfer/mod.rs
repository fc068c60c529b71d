//! Download stage: supervised archive transfer
//!
//! One external transfer process (or in-process HTTP stream) per item, tracked
//! in an active map keyed by release id. The transport mode is an environment
//! capability decided once at construction: `rclone` when the binary is
//! available (resumable, native progress stats), direct HTTP otherwise.

mod http;
pub mod progress;

pub use progress::parse_transfer_line;

use crate::config::Config;
use crate::types::{QueueItem, ReleaseId, TransferProgress};
use crate::utils::{next_line, push_tail};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// How many trailing tool-output lines are kept for failure diagnostics
const DIAGNOSTIC_TAIL_LINES: usize = 8;

/// Transport selected for this environment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// External rclone process: resumable, structured progress stats
    RemoteCopy,
    /// In-process streaming HTTP GET: always available, restarts from zero
    DirectHttp,
}

/// Why an in-flight transfer was told to stop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// User cancelled the item
    Cancelled,
    /// User paused the item; partial data is kept for resume
    Paused,
    /// Another subsystem decided the item failed
    Error(String),
    /// Process shutdown; the item's persisted status is left for restart
    /// recovery to requeue
    Shutdown,
}

/// Terminal result of one transfer attempt
#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The archive is fully present in the item's directory
    Completed,
    /// The transfer tool could not be started
    SpawnFailed(String),
    /// The transfer tool exited unsuccessfully
    Failed {
        /// Exit code, when the process exited normally
        code: Option<i32>,
        /// Tail of the tool's output
        detail: String,
    },
    /// A kill signal was requested and the worker confirmed exit
    Aborted(AbortReason),
}

struct ActiveTransfer {
    token: CancellationToken,
    reason: Arc<std::sync::Mutex<Option<AbortReason>>>,
}

/// Supervises one transfer at a time per release id
pub struct TransferStage {
    mode: TransportMode,
    rclone_path: Option<PathBuf>,
    base_uri: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    active: Arc<Mutex<HashMap<ReleaseId, ActiveTransfer>>>,
}

impl TransferStage {
    /// Build the stage, resolving the transport capability for this
    /// environment once.
    pub fn new(config: &Config) -> Self {
        let rclone_path = config.tools.rclone_path.clone().or_else(|| {
            if config.tools.search_path {
                which::which("rclone").ok()
            } else {
                None
            }
        });
        let mode = if rclone_path.is_some() {
            TransportMode::RemoteCopy
        } else {
            TransportMode::DirectHttp
        };
        tracing::info!(?mode, "Transfer transport selected");

        Self {
            mode,
            rclone_path,
            base_uri: config.source.base_uri.clone(),
            auth_token: config.source.auth_token.clone(),
            client: reqwest::Client::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The transport this environment ended up with
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Whether a paused transfer can continue from partial data
    pub fn resumable(&self) -> bool {
        self.mode == TransportMode::RemoteCopy
    }

    /// Whether a transfer for this release is genuinely tracked right now
    pub async fn is_active(&self, release_id: &ReleaseId) -> bool {
        self.active.lock().await.contains_key(release_id)
    }

    /// Archive filename for a release
    pub fn archive_name(release_id: &ReleaseId) -> String {
        format!("{release_id}.7z")
    }

    /// Request termination of an in-flight transfer.
    ///
    /// The status transition happens in the worker once the process confirms
    /// exit; this only records the reason and fires the kill signal. Returns
    /// `false` (a no-op) when no transfer is tracked for the id.
    pub async fn request_abort(&self, release_id: &ReleaseId, reason: AbortReason) -> bool {
        let active = self.active.lock().await;
        let Some(entry) = active.get(release_id) else {
            return false;
        };
        {
            let mut slot = match entry.reason.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // First abort wins; a later pause cannot repurpose a cancel
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        entry.token.cancel();
        true
    }

    /// Run the transfer for one item to a terminal outcome.
    ///
    /// `on_spawned` fires once with the child pid when an external process is
    /// used. `on_progress` fires for every parseable progress update; callers
    /// debounce observer fan-out themselves.
    pub async fn run(
        &self,
        item: &QueueItem,
        on_spawned: impl FnOnce(Option<u32>) + Send,
        on_progress: impl FnMut(TransferProgress) + Send,
    ) -> TransferOutcome {
        let token = CancellationToken::new();
        let reason = Arc::new(std::sync::Mutex::new(None));
        {
            let mut active = self.active.lock().await;
            active.insert(
                item.release_id.clone(),
                ActiveTransfer {
                    token: token.clone(),
                    reason: reason.clone(),
                },
            );
        }

        let outcome = match self.mode {
            TransportMode::RemoteCopy => {
                self.run_rclone(item, &token, on_spawned, on_progress).await
            }
            TransportMode::DirectHttp => {
                on_spawned(None);
                self.run_http(item, &token, on_progress).await
            }
        };

        self.active.lock().await.remove(&item.release_id);

        match outcome {
            TransferOutcome::Aborted(_) => {
                let taken = match reason.lock() {
                    Ok(mut guard) => guard.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                TransferOutcome::Aborted(taken.unwrap_or(AbortReason::Cancelled))
            }
            other => other,
        }
    }

    async fn run_rclone(
        &self,
        item: &QueueItem,
        token: &CancellationToken,
        on_spawned: impl FnOnce(Option<u32>) + Send,
        mut on_progress: impl FnMut(TransferProgress) + Send,
    ) -> TransferOutcome {
        let Some(binary) = self.rclone_path.as_ref() else {
            return TransferOutcome::SpawnFailed("rclone binary not resolved".to_string());
        };

        if let Err(e) = tokio::fs::create_dir_all(&item.download_path).await {
            return TransferOutcome::SpawnFailed(format!(
                "cannot create {}: {e}",
                item.download_path.display()
            ));
        }

        let mut command = Command::new(binary);
        command
            .arg("copy")
            .arg("--http-url")
            .arg(&self.base_uri)
            .arg(format!(":http:/{}", Self::archive_name(&item.release_id)))
            .arg(&item.download_path)
            .arg("--progress")
            .arg("--stats")
            .arg("1s")
            .arg("--retries")
            .arg("3")
            .arg("--low-level-retries")
            .arg("10");
        if let Some(token) = &self.auth_token {
            command.arg("--header").arg(format!("Authorization: Bearer {token}"));
        }
        command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return TransferOutcome::SpawnFailed(format!(
                    "{}: {e}",
                    binary.display()
                ));
            }
        };
        on_spawned(child.id());
        tracing::debug!(release_id = %item.release_id, pid = ?child.id(), "Transfer process spawned");

        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);

        let mut handle_line = |line: String, tail: &mut VecDeque<String>| {
            if let Some(update) = parse_transfer_line(&line) {
                on_progress(update);
            } else if !line.trim().is_empty() {
                push_tail(tail, line, DIAGNOSTIC_TAIL_LINES);
            }
        };

        let mut stdout_done = stdout_lines.is_none();
        let mut stderr_done = stderr_lines.is_none();
        while !(stdout_done && stderr_done) {
            tokio::select! {
                _ = token.cancelled() => {
                    child.start_kill().ok();
                    child.wait().await.ok();
                    return TransferOutcome::Aborted(AbortReason::Cancelled);
                }
                line = next_line(&mut stdout_lines), if !stdout_done => {
                    match line {
                        Some(line) => handle_line(line, &mut tail),
                        None => stdout_done = true,
                    }
                }
                line = next_line(&mut stderr_lines), if !stderr_done => {
                    match line {
                        Some(line) => handle_line(line, &mut tail),
                        None => stderr_done = true,
                    }
                }
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                return TransferOutcome::Failed {
                    code: None,
                    detail: format!("waiting for transfer process: {e}"),
                };
            }
        };

        if token.is_cancelled() {
            return TransferOutcome::Aborted(AbortReason::Cancelled);
        }

        if status.success() {
            on_progress(TransferProgress {
                percent: 100.0,
                speed_bps: None,
                eta_seconds: None,
            });
            TransferOutcome::Completed
        } else {
            TransferOutcome::Failed {
                code: status.code(),
                detail: tail.into_iter().collect::<Vec<_>>().join(" | "),
            }
        }
    }

    async fn run_http(
        &self,
        item: &QueueItem,
        token: &CancellationToken,
        on_progress: impl FnMut(TransferProgress) + Send,
    ) -> TransferOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&item.download_path).await {
            return TransferOutcome::SpawnFailed(format!(
                "cannot create {}: {e}",
                item.download_path.display()
            ));
        }

        let mut base = self.base_uri.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = match url::Url::parse(&base)
            .and_then(|base| base.join(&Self::archive_name(&item.release_id)))
        {
            Ok(url) => url,
            Err(e) => {
                return TransferOutcome::SpawnFailed(format!(
                    "invalid source uri {:?}: {e}",
                    self.base_uri
                ));
            }
        };

        let dest = item.download_path.join(Self::archive_name(&item.release_id));
        match http::download_to_file(
            &self.client,
            url,
            self.auth_token.as_deref(),
            &dest,
            token,
            on_progress,
        )
        .await
        {
            Ok(http::HttpOutcome::Completed) => TransferOutcome::Completed,
            Ok(http::HttpOutcome::Aborted) => TransferOutcome::Aborted(AbortReason::Cancelled),
            Err(e) => TransferOutcome::Failed {
                code: None,
                detail: e.to_string(),
            },
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_with_rclone(path: Option<PathBuf>, search_path: bool) -> Config {
        let mut config = Config::default();
        config.tools.rclone_path = path;
        config.tools.search_path = search_path;
        config
    }

    fn item_in(dir: &tempfile::TempDir) -> QueueItem {
        QueueItem::new("R1", "com.example.r1", "Release One", dir.path().join("R1"))
    }

    #[tokio::test]
    async fn explicit_rclone_path_selects_remote_copy() {
        let stage = TransferStage::new(&config_with_rclone(
            Some(PathBuf::from("/opt/bin/rclone")),
            false,
        ));
        assert_eq!(stage.mode(), TransportMode::RemoteCopy);
        assert!(stage.resumable());
    }

    #[tokio::test]
    async fn no_binary_and_no_path_search_falls_back_to_http() {
        let stage = TransferStage::new(&config_with_rclone(None, false));
        assert_eq!(stage.mode(), TransportMode::DirectHttp);
        assert!(!stage.resumable(), "direct HTTP restarts from zero");
    }

    #[tokio::test]
    async fn abort_with_nothing_tracked_is_a_no_op() {
        let stage = TransferStage::new(&config_with_rclone(None, false));
        let signalled = stage
            .request_abort(&"ghost".into(), AbortReason::Cancelled)
            .await;
        assert!(!signalled);
    }

    #[tokio::test]
    async fn spawn_failure_is_distinguished_from_exit_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stage = TransferStage::new(&config_with_rclone(
            Some(PathBuf::from("/nonexistent/bin/rclone")),
            false,
        ));
        let outcome = stage.run(&item_in(&dir), |_| {}, |_| {}).await;
        assert!(
            matches!(outcome, TransferOutcome::SpawnFailed(_)),
            "missing binary must surface as SpawnFailed, got {outcome:?}"
        );
        assert!(!stage.is_active(&"R1".into()).await, "entry untracked after exit");
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        fn fake_tool(dir: &tempfile::TempDir, name: &str, script: &str) -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn successful_process_reports_progress_and_completes() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(
                &dir,
                "rclone",
                concat!(
                    "echo 'Transferred: 1 MiB / 2 MiB, 50%, 1.0 MiB/s, ETA 1s' >&2\n",
                    "echo 'Transferred: 2 MiB / 2 MiB, 100%, 1.0 MiB/s, ETA 0s' >&2\n",
                    "exit 0\n"
                ),
            );
            let stage = TransferStage::new(&config_with_rclone(Some(tool), false));

            let mut seen = Vec::new();
            let mut pid = None;
            let outcome = stage
                .run(&item_in(&dir), |p| pid = p, |update| seen.push(update.percent))
                .await;

            assert_eq!(outcome, TransferOutcome::Completed);
            assert!(pid.is_some(), "spawned pid must be reported");
            assert!(seen.contains(&50.0));
            assert_eq!(*seen.last().unwrap(), 100.0);
        }

        #[tokio::test]
        async fn nonzero_exit_keeps_diagnostic_tail() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(
                &dir,
                "rclone",
                "echo 'Failed to copy: connection reset' >&2\nexit 3\n",
            );
            let stage = TransferStage::new(&config_with_rclone(Some(tool), false));

            let outcome = stage.run(&item_in(&dir), |_| {}, |_| {}).await;
            match outcome {
                TransferOutcome::Failed { code, detail } => {
                    assert_eq!(code, Some(3));
                    assert!(detail.contains("connection reset"));
                }
                other => panic!("expected Failed, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn abort_kills_the_process_and_reports_the_reason() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(&dir, "rclone", "sleep 30\n");
            let stage = std::sync::Arc::new(TransferStage::new(&config_with_rclone(
                Some(tool),
                false,
            )));

            let item = item_in(&dir);
            let runner = {
                let stage = stage.clone();
                let item = item.clone();
                tokio::spawn(async move { stage.run(&item, |_| {}, |_| {}).await })
            };

            // Wait until the transfer registers as active
            let id: ReleaseId = "R1".into();
            for _ in 0..100 {
                if stage.is_active(&id).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(stage.is_active(&id).await, "transfer never became active");

            assert!(stage.request_abort(&id, AbortReason::Paused).await);
            let outcome = runner.await.unwrap();
            assert_eq!(outcome, TransferOutcome::Aborted(AbortReason::Paused));
            assert!(!stage.is_active(&id).await);
        }
    }
}
