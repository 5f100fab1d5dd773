//! Running CGI/1.1 scripts on behalf of HTTP requests
//!
//! A request flows through the pieces in this order: `router` decides whether
//! the path names a script and finds it on disk, `environment` builds the
//! script's meta-variables, and a `gateway` runs it. The subprocess gateway
//! collects the script's output through `executor` and turns it into an HTTP
//! response with `parser`. `dispatcher` strings it all together.

pub mod dispatcher;
pub mod environment;
pub mod executor;
pub mod gateway;
pub mod parser;
pub mod router;

use std::fmt;
use std::io;
use std::time::Duration;

/// A status line
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    /// Reason phrase the script supplied, if any
    pub reason_phrase: Option<Vec<u8>>
}

/// A header a script asked to have sent
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub content: Vec<u8>
}

/// A script's output, split into the parts of an HTTP response
#[derive(Debug, PartialEq, Eq)]
pub struct CgiResponse {
    pub status: Status,
    /// In the order the script wrote them
    pub headers: Vec<Header>,
    pub body: Vec<u8>
}

/// Why a CGI request didn't produce the script's response
#[derive(Debug)]
pub enum Failure {
    /// The request itself was unusable, like a bogus `Content-Length`
    BadRequest(String),
    /// No script at the requested path
    NotFound,
    /// The path names something other than a regular file
    NotAFile,
    /// The script can't be run directly and there's no interpreter for it
    NotExecutable,
    /// The script ran but wrote nothing to stdout
    EmptyOutput { stderr: Vec<u8> },
    /// The script's header block made no sense
    MalformedOutput(String),
    /// The script ran past its time limit and was killed
    Timeout(Duration),
    /// Spawning or waiting on the script failed
    Execution(io::Error),
    /// Writing to the client failed; there's nobody left to answer
    Client(io::Error)
}

impl Failure {
    /// The status code the client sees, or `None` when no response can be
    /// sent.
    pub fn status(&self) -> Option<u16> {
        match *self {
            Failure::BadRequest(_) => Some(400),
            Failure::NotFound => Some(404),
            Failure::NotAFile | Failure::NotExecutable => Some(403),
            Failure::EmptyOutput { .. } |
            Failure::MalformedOutput(_) |
            Failure::Execution(_) => Some(500),
            Failure::Timeout(_) => Some(504),
            Failure::Client(_) => None
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Failure::BadRequest(ref why) => write!(f, "bad request: {}", why),
            Failure::NotFound => f.write_str("CGI script not found"),
            Failure::NotAFile => f.write_str("CGI script is not a plain file"),
            Failure::NotExecutable =>
                f.write_str("CGI script is not executable"),
            Failure::EmptyOutput { .. } =>
                f.write_str("CGI script produced no output"),
            Failure::MalformedOutput(ref why) =>
                write!(f, "error processing CGI output: {}", why),
            Failure::Timeout(limit) =>
                write!(f, "CGI script timed out after {:?}", limit),
            Failure::Execution(ref e) =>
                write!(f, "CGI execution failed: {}", e),
            Failure::Client(ref e) =>
                write!(f, "couldn't write the response: {}", e)
        }
    }
}

#[test]
fn failure_statuses() {
    assert_eq!(Failure::NotFound.status(), Some(404));
    assert_eq!(Failure::EmptyOutput { stderr: Vec::new() }.status(), Some(500));
    assert_eq!(Failure::MalformedOutput(String::new()).status(), Some(500));
    assert_eq!(Failure::Timeout(Duration::from_secs(1)).status(), Some(504));
    assert_eq!(Failure::Execution(io::Error::new(io::ErrorKind::Other, "x"))
               .status(), Some(500));
    assert_eq!(Failure::Client(io::Error::new(io::ErrorKind::Other, "x"))
               .status(), None);
}
