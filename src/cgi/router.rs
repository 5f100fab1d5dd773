//! Deciding which requests are CGI requests
//!
//! A path is a CGI path if it exactly names one of the allow-listed top-level
//! scripts, or if it lives under one of the configured CGI directories.

use cgi::Failure;
use filesystem::{resolve, RequestPath};

use std::path::{Path, PathBuf};

/// Where a CGI request points, before looking at the disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiTarget {
    /// The CGI directory the request went through, or `""` for an
    /// allow-listed script
    pub dir: String,
    /// The rest of the path after `dir` and its `'/'`
    pub rest: String,
    pub query: Option<String>
}

impl CgiTarget {
    /// The first segment of `rest`
    pub fn script_identity(&self) -> &str {
        match self.rest.find('/') {
            Some(i) => &self.rest[.. i],
            None => &self.rest
        }
    }
}

/// A script found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// The script's URL path, for `SCRIPT_NAME`
    pub name: String,
    /// Whatever followed the script in the URL, for `PATH_INFO`
    pub path_info: String,
    /// The script's real location, links resolved
    pub file: PathBuf
}

#[derive(Debug, Clone)]
pub struct CgiRouter {
    directories: Vec<String>,
    scripts: Vec<String>
}

impl CgiRouter {
    /// `directories` and `scripts` are URL paths leading with `'/'`, without
    /// a trailing `'/'`.
    pub fn new(directories: Vec<String>, scripts: Vec<String>) -> CgiRouter {
        CgiRouter {
            directories: directories,
            scripts: scripts
        }
    }

    /// Splits a CGI path into the directory it's under and the rest of it.
    ///
    /// Returns `None` for paths that aren't CGI paths.
    pub fn classify(&self, path: &RequestPath) -> Option<CgiTarget> {
        if self.scripts.iter().any(|s| *s == path.path) {
            return Some(CgiTarget {
                dir: String::new(),
                rest: String::from(&path.path[1 ..]),
                query: path.query.clone()
            });
        }

        // The shortest configured prefix ending at a '/' wins
        let mut separators = path.path.match_indices('/')
            .map(|(i, _)| i)
            .filter(|&i| i > 0);

        separators
            .find(|&i| self.directories.iter().any(|d| *d == path.path[.. i]))
            .map(|i| CgiTarget {
                dir: String::from(&path.path[.. i]),
                rest: String::from(&path.path[i + 1 ..]),
                query: path.query.clone()
            })
    }
}

/// Finds the script a CGI target refers to.
///
/// Leading segments of the target's remainder that are directories on disk
/// are walked into; the segment after them names the script, and anything
/// left over becomes the path info. The script must exist and be a regular
/// file.
pub fn locate_script<P: AsRef<Path>>(webroot: P, target: &CgiTarget)
                                     -> Result<Script, Failure>
{
    let webroot = webroot.as_ref();
    let mut dir = target.dir.clone();
    let mut rest = &target.rest[..];

    while let Some(i) = rest.find('/') {
        let next_dir = format!("{}/{}", dir, &rest[.. i]);
        if !resolve(webroot, &next_dir).is_dir() {
            break;
        }

        dir = next_dir;
        rest = &rest[i + 1 ..];
    }

    let (script, path_info) = match rest.find('/') {
        Some(i) => (&rest[.. i], &rest[i ..]),
        None => (rest, "")
    };

    let name = format!("{}/{}", dir, script);
    let file = resolve(webroot, &name);

    if !file.exists() {
        return Err(Failure::NotFound);
    }

    if !file.is_file() {
        return Err(Failure::NotAFile);
    }

    Ok(Script {
        name: name,
        path_info: String::from(path_info),
        file: file
    })
}
