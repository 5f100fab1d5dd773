//! Smol utilities for logging

use std::ascii;

/// Longest slice of child output that goes into a single log line
const LOG_PREVIEW_LIMIT: usize = 4096;

/// Make an Ascii-safe string
pub fn ascii_escape(s: &[u8]) -> String {
    s.iter()
        .flat_map(|&b| ascii::escape_default(b))
        .map(char::from)
        .collect()
}

/// Like `ascii_escape`, but cuts long input down to something a log line can
/// hold.
pub fn escape_preview(s: &[u8]) -> String {
    if s.len() <= LOG_PREVIEW_LIMIT {
        return ascii_escape(s);
    }

    format!("{}... ({} more bytes)",
            ascii_escape(&s[.. LOG_PREVIEW_LIMIT]),
            s.len() - LOG_PREVIEW_LIMIT)
}

#[test]
fn ascii_escape_escapes_control_and_high_bytes() {
    assert_eq!(ascii_escape(b"oops\n\xff"), "oops\\n\\xff");
}

#[test]
fn escape_preview_truncates() {
    let long = vec![b'a'; LOG_PREVIEW_LIMIT + 10];
    let preview = escape_preview(&long);

    assert!(preview.ends_with("... (10 more bytes)"));
}
