//! Parser for the transfer tool's progress stream
//!
//! rclone with `--progress --stats 1s` interleaves stats lines of the form:
//!
//! ```text
//! Transferred:        12.345 MiB / 100.456 MiB, 12%, 1.5 MiB/s, ETA 58s
//! ```
//!
//! The parser has a narrow contract: one raw line in, a structured progress
//! record or `None` out. It never touches a process, so it is unit-testable
//! in isolation from spawning.

use crate::types::TransferProgress;
use regex::Regex;
use std::sync::OnceLock;

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%").expect("static regex"))
}

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\d.]+)\s*([KMGT]?i?B)/s").expect("static regex"))
}

fn eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ETA\s+(\S+)").expect("static regex"))
}

/// Parse one raw output line into a progress record.
///
/// Returns `None` for anything that is not a per-transfer stats line: file
/// listings, the transferred-file-count summary, blank lines, and log noise
/// all fall through silently.
pub fn parse_transfer_line(line: &str) -> Option<TransferProgress> {
    let lower = line.to_lowercase();
    if !lower.contains("transferred:") || !line.contains('%') {
        return None;
    }

    let percent: u32 = percent_re()
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    if percent > 100 {
        return None;
    }

    let speed_bps = speed_re().captures(line).and_then(|caps| {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str();
        Some((value * unit_multiplier(unit)) as u64)
    });

    let eta_seconds = eta_re()
        .captures(line)
        .and_then(|caps| parse_eta(caps.get(1)?.as_str()));

    Some(TransferProgress {
        percent: percent as f32,
        speed_bps,
        eta_seconds,
    })
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "B" => 1.0,
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "TB" => 1024.0f64.powi(4),
        _ => 1.0,
    }
}

/// Parse an rclone ETA token like `58s`, `1m30s` or `2h3m4s`.
///
/// `-` means the ETA is unknown.
fn parse_eta(token: &str) -> Option<u64> {
    if token == "-" {
        return None;
    }
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut any = false;
    for ch in token.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        total += match ch {
            'd' => value * 86_400,
            'h' => value * 3_600,
            'm' => value * 60,
            's' => value,
            _ => return None,
        };
        any = true;
    }
    if !digits.is_empty() || !any {
        return None;
    }
    Some(total)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_stats_line() {
        let line = "Transferred:        12.345 MiB / 100.456 MiB, 12%, 1.5 MiB/s, ETA 58s";
        let progress = parse_transfer_line(line).unwrap();
        assert_eq!(progress.percent, 12.0);
        assert_eq!(progress.speed_bps, Some((1.5 * 1024.0 * 1024.0) as u64));
        assert_eq!(progress.eta_seconds, Some(58));
    }

    #[test]
    fn parses_compound_eta() {
        let line = "Transferred:   1.2 GiB / 8.0 GiB, 15%, 24.3 MiB/s, ETA 4m48s";
        let progress = parse_transfer_line(line).unwrap();
        assert_eq!(progress.eta_seconds, Some(4 * 60 + 48));
    }

    #[test]
    fn parses_hours_in_eta() {
        let line = "Transferred:   0.5 GiB / 90 GiB, 1%, 10.0 MiB/s, ETA 2h32m10s";
        let progress = parse_transfer_line(line).unwrap();
        assert_eq!(progress.eta_seconds, Some(2 * 3600 + 32 * 60 + 10));
    }

    #[test]
    fn unknown_eta_dash_maps_to_none() {
        let line = "Transferred:   0 B / 10 MiB, 0%, 0 B/s, ETA -";
        let progress = parse_transfer_line(line).unwrap();
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.eta_seconds, None);
    }

    #[test]
    fn hundred_percent_line_parses() {
        let line = "Transferred:   10 MiB / 10 MiB, 100%, 2.0 MiB/s, ETA 0s";
        let progress = parse_transfer_line(line).unwrap();
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.eta_seconds, Some(0));
    }

    #[test]
    fn file_count_summary_line_is_ignored() {
        // rclone's second Transferred line counts files, not bytes
        assert!(parse_transfer_line("Transferred:            1 / 1, 100%").is_some());
        assert!(parse_transfer_line("Transferred:            0 / 1, -").is_none());
    }

    #[test]
    fn non_stats_lines_are_ignored() {
        for line in [
            "",
            "2024/01/01 12:00:00 INFO  : starting transfer",
            "Elapsed time:        1.5s",
            "Checks:                 0 / 0, -",
            " *  release.7z: 40% /10Mi, 2Mi/s, 3s",
        ] {
            assert!(
                parse_transfer_line(line).is_none(),
                "line should not parse: {line:?}"
            );
        }
    }

    #[test]
    fn out_of_range_percent_is_rejected() {
        assert!(parse_transfer_line("Transferred: junk, 250%, junk").is_none());
    }

    #[test]
    fn speed_units_scale_correctly() {
        let kib = parse_transfer_line("Transferred: 1 MiB / 2 MiB, 50%, 100 KiB/s, ETA 10s")
            .unwrap();
        assert_eq!(kib.speed_bps, Some(100 * 1024));

        let bytes = parse_transfer_line("Transferred: 1 KiB / 2 KiB, 50%, 512 B/s, ETA 2s")
            .unwrap();
        assert_eq!(bytes.speed_bps, Some(512));
    }

    #[test]
    fn parse_eta_rejects_garbage() {
        assert_eq!(parse_eta("soon"), None);
        assert_eq!(parse_eta("12"), None);
        assert_eq!(parse_eta(""), None);
    }
}
