//! Direct-HTTP fallback transport
//!
//! Used when rclone is unavailable in the environment (e.g., sandboxed
//! filesystems where the remote-copy tool cannot run). Streams the archive
//! straight to disk with an in-process client. Unlike the remote-copy
//! transport this mode cannot resume: a restarted transfer begins at zero.

use crate::error::{Result, TransferError};
use crate::types::TransferProgress;
use futures::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Terminal result of one HTTP transfer attempt
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HttpOutcome {
    /// The body was fully written to disk
    Completed,
    /// The cancellation token fired before the body finished
    Aborted,
}

/// Stream `url` into `dest`, reporting integer-percent progress steps.
///
/// `on_progress` fires at most once per percent step (plus a final 100%), so
/// callers can persist each update without flooding the store.
pub(crate) async fn download_to_file(
    client: &reqwest::Client,
    url: url::Url,
    auth_token: Option<&str>,
    dest: &Path,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(TransferProgress),
) -> Result<HttpOutcome> {
    let mut request = client.get(url);
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?.error_for_status()?;
    let total_bytes = response.content_length();

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();

    let started = Instant::now();
    let mut downloaded: u64 = 0;
    let mut last_step: Option<u32> = None;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Keep the partial file; a retry restarts from zero anyway,
                // and File::create truncates.
                file.flush().await.ok();
                return Ok(HttpOutcome::Aborted);
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if let Some(total) = total_bytes
            && total > 0
        {
            let step = ((downloaded * 100) / total).min(100) as u32;
            if last_step != Some(step) {
                last_step = Some(step);
                let elapsed = started.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    Some((downloaded as f64 / elapsed) as u64)
                } else {
                    None
                };
                let eta = speed.filter(|&bps| bps > 0).map(|bps| {
                    total.saturating_sub(downloaded) / bps
                });
                on_progress(TransferProgress {
                    percent: step as f32,
                    speed_bps: speed,
                    eta_seconds: eta,
                });
            }
        }
    }

    file.flush().await?;

    if let Some(total) = total_bytes
        && downloaded < total
    {
        return Err(TransferError::ExitFailure {
            code: None,
            detail: format!("response body truncated at {downloaded} of {total} bytes"),
        }
        .into());
    }

    on_progress(TransferProgress {
        percent: 100.0,
        speed_bps: None,
        eta_seconds: None,
    });
    Ok(HttpOutcome::Completed)
}
