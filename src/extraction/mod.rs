//! Extraction stage: supervised archive decompression
//!
//! Spawns the external 7z tool against the downloaded archive with `-bsp1`
//! so percent progress arrives as a structured output stream, and republishes
//! each parseable step. Cancellation kills the archiver; the caller owns the
//! resulting status transition.

use crate::config::Config;
use crate::types::ReleaseId;
use crate::utils::{next_line, push_tail};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// How many trailing tool-output lines are kept for failure diagnostics
const DIAGNOSTIC_TAIL_LINES: usize = 8;

/// Archive extensions the archiver is asked to open
const ARCHIVE_EXTENSIONS: [&str; 3] = ["7z", "zip", "rar"];

/// Terminal result of one extraction attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// The archive was fully unpacked into the item's directory
    Completed,
    /// The archiver could not be started (missing binary, missing archive)
    SpawnFailed(String),
    /// The archiver exited unsuccessfully
    Failed {
        /// Exit code, when the process exited normally
        code: Option<i32>,
        /// Tail of the tool's output
        detail: String,
    },
    /// The archiver was killed by a cancellation request
    Aborted,
}

/// Supervises one archiver process at a time per release id
pub struct ExtractionStage {
    sevenzip_path: Option<PathBuf>,
    active: Arc<Mutex<HashMap<ReleaseId, CancellationToken>>>,
}

impl ExtractionStage {
    /// Build the stage, resolving the archiver binary once.
    pub fn new(config: &Config) -> Self {
        let sevenzip_path = config.tools.sevenzip_path.clone().or_else(|| {
            if config.tools.search_path {
                ["7z", "7zz", "7za"]
                    .iter()
                    .find_map(|name| which::which(name).ok())
            } else {
                None
            }
        });
        if sevenzip_path.is_none() {
            tracing::warn!("No 7z binary found, extraction is unavailable");
        }

        Self {
            sevenzip_path,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether an archiver binary was resolved for this environment
    pub fn available(&self) -> bool {
        self.sevenzip_path.is_some()
    }

    /// Whether an extraction for this release is genuinely tracked right now
    pub async fn is_active(&self, release_id: &ReleaseId) -> bool {
        self.active.lock().await.contains_key(release_id)
    }

    /// Kill an in-flight extraction. Returns `false` (a no-op) when nothing
    /// is tracked for the id. The caller transitions the item's status.
    pub async fn cancel(&self, release_id: &ReleaseId) -> bool {
        let active = self.active.lock().await;
        match active.get(release_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Unpack the item's archive in place, streaming percent progress.
    pub async fn run(
        &self,
        release_id: &ReleaseId,
        download_path: &Path,
        on_spawned: impl FnOnce(Option<u32>) + Send,
        mut on_progress: impl FnMut(f32) + Send,
    ) -> ExtractionOutcome {
        let Some(binary) = self.sevenzip_path.as_ref() else {
            return ExtractionOutcome::SpawnFailed("7z binary not resolved".to_string());
        };
        let Some(archive) = find_archive(download_path).await else {
            return ExtractionOutcome::SpawnFailed(format!(
                "no archive found under {}",
                download_path.display()
            ));
        };

        let token = CancellationToken::new();
        self.active
            .lock()
            .await
            .insert(release_id.clone(), token.clone());
        let outcome = self
            .run_archiver(binary, &archive, download_path, &token, on_spawned, &mut on_progress)
            .await;
        self.active.lock().await.remove(release_id);

        if matches!(outcome, ExtractionOutcome::Completed) {
            on_progress(100.0);
        }
        outcome
    }

    async fn run_archiver(
        &self,
        binary: &Path,
        archive: &Path,
        dest: &Path,
        token: &CancellationToken,
        on_spawned: impl FnOnce(Option<u32>) + Send,
        on_progress: &mut (impl FnMut(f32) + Send),
    ) -> ExtractionOutcome {
        let mut command = Command::new(binary);
        command
            .arg("x")
            .arg(archive)
            .arg(format!("-o{}", dest.display()))
            .arg("-y")
            .arg("-bsp1")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExtractionOutcome::SpawnFailed(format!("{}: {e}", binary.display()));
            }
        };
        on_spawned(child.id());
        tracing::debug!(archive = %archive.display(), pid = ?child.id(), "Archiver spawned");

        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);

        let mut handle_line = |line: String, tail: &mut VecDeque<String>| {
            if let Some(percent) = parse_extract_line(&line) {
                on_progress(percent);
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
                    return ExtractionOutcome::Aborted;
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
                return ExtractionOutcome::Failed {
                    code: None,
                    detail: format!("waiting for archiver: {e}"),
                };
            }
        };

        if token.is_cancelled() {
            return ExtractionOutcome::Aborted;
        }

        if status.success() {
            ExtractionOutcome::Completed
        } else {
            ExtractionOutcome::Failed {
                code: status.code(),
                detail: tail.into_iter().collect::<Vec<_>>().join(" | "),
            }
        }
    }
}

/// Locate the downloaded archive inside the item's directory.
///
/// The transfer stage writes `<release>.7z`, but a resumed or manually placed
/// directory may hold any supported archive; the first match wins.
async fn find_archive(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_archive = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                ARCHIVE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            });
        if is_archive {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates.into_iter().next()
}

/// Parse one archiver output line into a percent value.
///
/// 7z's `-bsp1` stream emits lines like `` 12%`` or `` 43% 12 - name.apk``.
/// Anything else (banners, file listings, "Everything is Ok") is `None`.
pub fn parse_extract_line(line: &str) -> Option<f32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\s*(\d{1,3})%").expect("static regex"));
    let percent: u32 = re.captures(line)?.get(1)?.as_str().parse().ok()?;
    if percent > 100 {
        return None;
    }
    Some(percent as f32)
}
