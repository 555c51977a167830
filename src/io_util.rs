//! Encoding resolution, line splitting, time-prefix formatting, and
//! line-limit clamping shared by the synchronous executor and the
//! background supervisor.

use chrono::{DateTime, Local};
use encoding_rs::Encoding;
use std::time::SystemTime;
use thiserror::Error;

/// Default timestamp format used when time-prefixing log lines.
pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// An unsupported encoding name was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct IoUtilError(pub String);

/// Resolve the encoding to use for a request: the request's explicit
/// encoding if given, otherwise the configured default.
pub fn resolve_encoding(
    requested: Option<&str>,
    default_encoding: &str,
) -> Result<&'static Encoding, IoUtilError> {
    let name = requested.unwrap_or(default_encoding);
    Encoding::for_label(name.as_bytes())
        .ok_or_else(|| IoUtilError(format!("Unsupported encoding: {name}")))
}

/// Decode bytes with the given encoding, replacing malformed sequences
/// with the Unicode replacement character. Never fails.
pub fn decode_lossy(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Split text on `\n`, preserving empty lines and stripping a trailing `\r`
/// from each line (CRLF-tolerant). The final segment is included even
/// without a trailing newline.
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect();
    // A trailing "\n" produces one spurious empty trailing segment from
    // split('\n'); drop it so "a\nb\n" yields ["a", "b"] not ["a","b",""].
    if text.ends_with('\n') {
        lines.pop();
    }
    lines
}

/// Incrementally splits a raw byte stream into decoded logical lines,
/// tolerating malformed byte sequences via lossy decoding. Used by readers
/// that must produce one logical line at a time rather than wait for the
/// whole stream (the background supervisor's per-process log readers).
pub struct LineSplitter {
    encoding: &'static Encoding,
    buffer: Vec<u8>,
}

impl LineSplitter {
    #[must_use]
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            buffer: Vec::new(),
        }
    }

    /// Feed newly read bytes in, returning any complete lines they produced.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            line_bytes.pop(); // drop the '\n'
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.pop();
            }
            lines.push(decode_lossy(&line_bytes, self.encoding));
        }
        lines
    }

    /// Flush a partial trailing line on EOF, if any bytes remain.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            let remaining = std::mem::take(&mut self.buffer);
            Some(decode_lossy(&remaining, self.encoding))
        }
    }
}

/// Format a timestamp with the given strftime-compatible format string.
/// An invalid format string falls back to [`DEFAULT_TIME_FORMAT`].
pub fn format_time_prefix(ts: SystemTime, format: &str) -> String {
    let local: DateTime<Local> = ts.into();
    let rendered = format_or_none(&local, format).unwrap_or_else(|| {
        format_or_none(&local, DEFAULT_TIME_FORMAT)
            .expect("default time format must always render")
    });
    format!("[{rendered}] ")
}

fn format_or_none(dt: &DateTime<Local>, format: &str) -> Option<String> {
    // chrono's `format` never panics on an invalid spec at call time, but
    // it does emit literal `%?` markers for unrecognized items; treat any
    // such marker as "invalid format" and fall back.
    let rendered = dt.format(format).to_string();
    if rendered.contains("%?") {
        None
    } else {
        Some(rendered)
    }
}

/// Clamp a slice to its last `limit` items, returning the clamped slice
/// (cloned) and the count of items dropped from the front. `limit = None`
/// means no clamping.
pub fn clamp_tail<T: Clone>(items: &[T], limit: Option<usize>) -> (Vec<T>, usize) {
    match limit {
        None => (items.to_vec(), 0),
        Some(limit) if items.len() <= limit => (items.to_vec(), 0),
        Some(limit) => {
            let dropped = items.len() - limit;
            (items[dropped..].to_vec(), dropped)
        }
    }
}

/// Clamp a block of already-decoded text to its last `limit` lines,
/// prepending a synthetic "... N earlier lines omitted ..." line when at
/// least one line was dropped.
pub fn clamp_block_text(text: &str, limit: usize) -> String {
    let lines = split_lines(text);
    if lines.len() <= limit {
        // Nothing to drop -- return the text untouched so trailing-newline
        // shape (a real artifact of the child's own output) survives.
        return text.to_string();
    }
    let (mut kept, dropped) = clamp_tail(&lines, Some(limit));
    kept.insert(0, format!("… {dropped} earlier lines omitted …"));
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_encoding_defaults() {
        let enc = resolve_encoding(None, "utf-8").unwrap();
        assert_eq!(enc.name(), "UTF-8");
    }

    #[test]
    fn resolve_encoding_unknown_errors() {
        let err = resolve_encoding(Some("not-a-real-encoding"), "utf-8").unwrap_err();
        assert_eq!(err.0, "Unsupported encoding: not-a-real-encoding");
    }

    #[test]
    fn decode_lossy_replaces_invalid_bytes() {
        let bytes = [0x68, 0x69, 0xff, 0xfe];
        let text = decode_lossy(&bytes, encoding_rs::UTF_8);
        assert!(text.starts_with("hi"));
        assert!(text.contains('\u{FFFD}'));
    }

    #[test]
    fn split_lines_preserves_empty_lines() {
        assert_eq!(split_lines("a\n\nb"), vec!["a", "", "b"]);
    }

    #[test]
    fn split_lines_drops_trailing_newline_artifact() {
        assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
    }

    #[test]
    fn split_lines_empty_input() {
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn line_splitter_flushes_partial_last_line() {
        let mut splitter = LineSplitter::new(encoding_rs::UTF_8);
        let lines = splitter.push_bytes(b"line1\nline2\npartial");
        assert_eq!(lines, vec!["line1", "line2"]);
        assert_eq!(splitter.flush(), Some("partial".to_string()));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn line_splitter_strips_crlf() {
        let mut splitter = LineSplitter::new(encoding_rs::UTF_8);
        let lines = splitter.push_bytes(b"a\r\nb\r\n");
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn invalid_time_format_falls_back_to_default() {
        let now = SystemTime::now();
        let prefix = format_time_prefix(now, "%Q%not-a-real-spec");
        assert!(prefix.starts_with('['));
        assert!(prefix.ends_with("] "));
    }

    #[test]
    fn clamp_tail_no_limit() {
        let items = vec![1, 2, 3];
        let (kept, dropped) = clamp_tail(&items, None);
        assert_eq!(kept, vec![1, 2, 3]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn clamp_tail_keeps_last_n() {
        let items = vec![1, 2, 3, 4, 5];
        let (kept, dropped) = clamp_tail(&items, Some(2));
        assert_eq!(kept, vec![4, 5]);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn clamp_tail_limit_larger_than_len_is_noop() {
        let items = vec![1, 2];
        let (kept, dropped) = clamp_tail(&items, Some(10));
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn clamp_block_text_prepends_sentinel_when_dropped() {
        let text = "a\nb\nc\nd\ne";
        let clamped = clamp_block_text(text, 2);
        assert_eq!(clamped, "… 3 earlier lines omitted …\nd\ne");
    }

    #[test]
    fn clamp_block_text_no_sentinel_when_nothing_dropped() {
        let text = "a\nb";
        let clamped = clamp_block_text(text, 5);
        assert_eq!(clamped, "a\nb");
    }
}
