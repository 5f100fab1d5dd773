//! Helpers for filesystem manipulations
//!
//! Request paths go through two steps before anything touches the disk:
//! `collapse` decodes and normalizes the URL path (keeping the query string
//! aside), and `resolve` maps the collapsed path under the web root and follows
//! every symbolic link to its real target.

use errors::{Result, Error};

use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A request path after percent-decoding and dot-segment removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    /// Decoded path, always leading with `'/'`. A trailing `'/'` from the
    /// request is kept.
    pub path: String,
    /// Raw (still percent-encoded) query string, without the `'?'`
    pub query: Option<String>
}

/// Splits the query string and any fragment off a request-uri.
pub fn split_query(uri: &str) -> (&str, Option<&str>) {
    let uri = match uri.find('#') {
        Some(i) => &uri[.. i],
        None => uri
    };

    match uri.find('?') {
        Some(i) => (&uri[.. i], Some(&uri[i + 1 ..])),
        None => (uri, None)
    }
}

/// Decodes and collapses a request-uri.
///
/// Empty and `.` segments are dropped and `..` removes the segment before it.
/// A `..` with nothing left to remove is an `Err`, as is a path without a
/// leading `'/'` or with bogus percent-encoding.
pub fn collapse(uri: &str) -> Result<RequestPath> {
    let (raw_path, query) = split_query(uri);

    if !raw_path.starts_with('/') {
        return Err(Error::PathNotInOriginForm);
    }

    let decoded = percent_decode(raw_path.as_bytes())?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::IllegalPercentEncoding)?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => (),
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::PathEscapesRoot);
                }
            },
            s => segments.push(s)
        }
    }

    let mut path = String::with_capacity(decoded.len());
    path.push('/');
    path.push_str(&segments.join("/"));

    let ends_in_dir = decoded.ends_with('/') ||
        decoded.ends_with("/.") ||
        decoded.ends_with("/..");
    if ends_in_dir && !segments.is_empty() {
        path.push('/');
    }

    Ok(RequestPath {
        path: path,
        query: query.map(String::from)
    })
}

/// Maps a collapsed request path onto `webroot` and resolves symbolic links.
///
/// A path that doesn't exist can't be resolved; it comes back as the plain
/// joined path, and callers decide whether that's a 404.
pub fn resolve<P: AsRef<Path>>(webroot: P, path: &str) -> PathBuf {
    let mut translated = webroot.as_ref().to_path_buf();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        translated.push(OsStr::from_bytes(segment.as_bytes()));
    }

    match fs::canonicalize(&translated) {
        Ok(real) => real,
        Err(e) => {
            debug!("Couldn't resolve {:?}: {}", translated, e);
            translated
        }
    }
}

/// Translates a raw request-uri into a canonical filesystem path under
/// `webroot`.
pub fn translate_path<P: AsRef<Path>>(webroot: P, uri: &str) -> Result<PathBuf> {
    let collapsed = collapse(uri)?;
    Ok(resolve(webroot, &collapsed.path))
}

/// Decodes percent-encoded bytes.
///
/// Bogus percent-encoding, like `b"%bo"`, will return `Err`.
pub fn percent_decode(path: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(path.len());

    let mut i = 0;
    while i < path.len() {
        match path[i] {
            // '%'
            0x25 => {
                if i + 2 >= path.len() {
                    return Err(Error::IllegalPercentEncoding);
                }

                let high_nybble = path[i + 1];
                let low_nybble = path[i + 2];

                if !is_hexit(high_nybble) || !is_hexit(low_nybble) {
                    return Err(Error::IllegalPercentEncoding);
                }

                buffer.push(from_hexit(high_nybble) << 4 |
                            from_hexit(low_nybble));

                i += 3;
            },
            b => {
                buffer.push(b);
                i += 1;
            }
        }
    }

    Ok(buffer)
}


/// Returns `true` iff the byte is a hexadecimal digit according to ASCII
fn is_hexit(x: u8) -> bool {
    (0x30 <= x && x <= 0x39) ||
    (0x41 <= x && x <= 0x46) ||
    (0x61 <= x && x <= 0x66)
}

/// Converts from a hexadecimal digit to its value
///
/// Only call this on bytes `is_hexit` accepts.
fn from_hexit(x: u8) -> u8 {
    if 0x30 <= x && x <= 0x39 {
        x - 0x30
    }
    else if 0x41 <= x && x <= 0x46 {
        x - 0x41 + 10
    }
    else {
        x - 0x61 + 10
    }
}

#[test]
fn from_hexit_works() {
    use std::char;

    for x in 0x0 .. 0x10 {
        assert_eq!(from_hexit(char::from_digit(x, 16).unwrap() as u8), x as u8);
    }
}
