//! Error handling for the http server

use httparse;

use std::fmt;
use std::io;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise within the HTTP plumbing
#[derive(Debug)]
pub enum Error {
    Parse(httparse::Error),
    Io(io::Error),
    RequestLineTooLong,
    PathNotInOriginForm,
    IllegalPercentEncoding,
    PathEscapesRoot,
    BadContentLength,
    RequestIncomplete,
    PermissionDenied,
    MethodNotAllowed
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Parse(ref e) => write!(f, "malformed request: {}", e),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::RequestLineTooLong => f.write_str("request head too long"),
            Error::PathNotInOriginForm =>
                f.write_str("request path is not in origin form"),
            Error::IllegalPercentEncoding =>
                f.write_str("illegal percent-encoding in request path"),
            Error::PathEscapesRoot =>
                f.write_str("request path escapes the web root"),
            Error::BadContentLength => f.write_str("invalid Content-Length"),
            Error::RequestIncomplete =>
                f.write_str("connection closed before the request head ended"),
            Error::PermissionDenied => f.write_str("permission denied"),
            Error::MethodNotAllowed =>
                f.write_str("method not allowed for static files")
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
