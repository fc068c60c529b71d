//! Utility functions shared by the stage supervisors

use std::collections::VecDeque;
use tokio::io::{BufReader, Lines};

/// Pull the next line from an optional line stream, folding read errors into
/// end-of-stream. The stream is `None` only when the pipe was never attached.
pub(crate) async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Append a line to a bounded diagnostic tail, dropping the oldest entry
pub(crate) fn push_tail(tail: &mut VecDeque<String>, line: String, cap: usize) {
    if tail.len() == cap {
        tail.pop_front();
    }
    tail.push_back(line);
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn push_tail_keeps_only_the_newest_lines() {
        let mut tail = VecDeque::new();
        for i in 0..10 {
            push_tail(&mut tail, format!("line {i}"), 3);
        }
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.front().map(String::as_str), Some("line 7"));
        assert_eq!(tail.back().map(String::as_str), Some("line 9"));
    }

    #[tokio::test]
    async fn next_line_on_missing_stream_is_end_of_stream() {
        let mut lines: Option<Lines<BufReader<tokio::io::DuplexStream>>> = None;
        assert_eq!(next_line(&mut lines).await, None);
    }

    #[tokio::test]
    async fn next_line_reads_until_exhausted() {
        let data = b"one\ntwo\n".to_vec();
        let mut lines = Some(BufReader::new(std::io::Cursor::new(data)).lines());
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("one"));
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("two"));
        assert_eq!(next_line(&mut lines).await, None);
    }
}
