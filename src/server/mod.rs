//! Server functionality

pub mod static_files;

use cgi::dispatcher::Dispatcher;
use config::{Config, ExecStrategy};
use errors::{Result, Error};
use server::error_messages::error_page;

use httparse;
use mime::Mime;

use std::fmt;
use std::fs::canonicalize;
use std::io::{self, Read, BufRead, BufReader, Cursor, Write, BufWriter};
use std::net::{TcpListener, TcpStream, SocketAddr, Shutdown};
use std::slice;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What we call ourselves in `Server` headers and `SERVER_SOFTWARE`
pub const SERVER_SOFTWARE: &'static str =
    concat!("cgi-server/", env!("CARGO_PKG_VERSION"));

/// The protocol we answer in
pub const SERVER_PROTOCOL: &'static str = "HTTP/1.1";

/// Longest request head we'll buffer before giving up
const MAX_HEAD_LENGTH: usize = 64 * 1024;

/// Binds the configured address and serves requests through a `Dispatcher`
/// running scripts with `strategy`.
pub fn serve(mut config: Config, strategy: ExecStrategy) -> Result<()> {
    let listener = TcpListener::bind((config.bind, config.port))?;
    config.stat.webroot = canonicalize(&config.stat.webroot)?;

    info!("Serving HTTP on {} port {}, web root {:?}",
          config.bind, config.port, config.stat.webroot);

    let concurrent = config.concurrent;
    let handler: Arc<dyn Handler> = Arc::new(Dispatcher::new(&config, strategy));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if concurrent {
                    let handler = handler.clone();
                    thread::spawn(move || handle_client(stream, &*handler));
                }
                else {
                    handle_client(stream, &*handler);
                }
            },
            Err(e) => {
                warn!("Failed connection: {}", e);
            }
        };
    }

    Ok(())
}

/// Serves exactly one request on `stream`, then closes it.
fn handle_client(stream: TcpStream, handler: &dyn Handler) {
    if let Err(e) = serve_connection(stream, handler) {
        warn!("Error serving a connection: {}", e);
    }
}

fn serve_connection(stream: TcpStream, handler: &dyn Handler) -> Result<()> {
    stream.set_read_timeout(Some(Duration::new(5, 0)))?;
    stream.set_write_timeout(Some(Duration::new(5, 0)))?;

    let peer_addr = stream.peer_addr()?;
    let local_port = stream.local_addr()?.port();
    let mut res = Response::new(Box::new(stream.try_clone()?));

    let request = Request::parse(Box::new(stream.try_clone()?), peer_addr,
                                 local_port);
    let mut req = match request {
        Ok(req) => req,
        Err(Error::Io(e)) => return Err(Error::Io(e)),
        Err(Error::RequestIncomplete) => {
            debug!("{} closed the connection mid-request", peer_addr);
            return Ok(());
        },
        Err(e) => {
            warn!("Bad request from {}: {}", peer_addr, e);
            error_page(&mut res, 400)?;
            res.flush()?;
            return Ok(());
        }
    };

    handler.serve(&mut req, &mut res);
    res.flush()?;

    info!("{} \"{} {}\" {}", peer_addr, req.method(), req.request_uri(),
          res.status_code());

    if let Err(e) = stream.shutdown(Shutdown::Write) {
        debug!("Couldn't shut down the connection to {}: {}", peer_addr, e);
    }
    Ok(())
}

/// Values which can handle requests
pub trait Handler: Send + Sync {
    fn serve(&self, req: &mut Request, res: &mut Response);
}

/// An incoming request from the client
///
/// Only the head is parsed up front. The body stays in the connection and is
/// available through `Read`.
pub struct Request {
    method: String,
    uri: String,
    headers: Headers,
    rest: BufReader<Box<dyn Read + Send>>,
    pub remote_addr: SocketAddr,
    pub local_port: u16
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("remote_addr", &self.remote_addr)
            .field("local_port", &self.local_port)
            .finish()
    }
}

impl Request {
    /// Reads a request head off `stream`.
    pub fn parse(mut stream: Box<dyn Read + Send>, remote_addr: SocketAddr,
                 local_port: u16) -> Result<Request> {
        let (leftover, method, uri, headers) = parse_inner(&mut stream)?;

        let rest: Box<dyn Read + Send> =
            Box::new(Cursor::new(leftover).chain(stream));

        Ok(Request {
            method: method,
            uri: uri,
            headers: headers,
            rest: BufReader::new(rest),
            remote_addr: remote_addr,
            local_port: local_port
        })
    }

    /// The request-target exactly as the client sent it
    #[inline]
    pub fn request_uri(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The declared `Content-Length`, if any
    pub fn content_length(&self) -> Result<Option<u64>> {
        let raw = match self.headers.get("Content-Length") {
            Some(raw) => raw,
            None => return Ok(None)
        };

        ::std::str::from_utf8(raw).ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or(Error::BadContentLength)
    }
}

/// Reads from `source` until a whole request head is available.
///
/// Returns whatever was read past the head, followed by the head's parts.
fn parse_inner<R: Read>(mut source: R) -> Result<(Vec<u8>,
                                                 String,
                                                 String,
                                                 Headers)>
{
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let read = match source.read(&mut chunk) {
            Ok(0) => return Err(Error::RequestIncomplete),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e))
        };
        buffer.extend_from_slice(&chunk[.. read]);

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 100];
            let mut req = httparse::Request::new(&mut headers);

            match req.parse(&buffer)? {
                httparse::Status::Complete(consumed) => {
                    let mut parsed_headers = Headers::new();
                    for header in req.headers.iter() {
                        parsed_headers.insert(header.name,
                                              Vec::from(header.value));
                    }

                    Some((consumed,
                          String::from(req.method.unwrap_or("")),
                          String::from(req.path.unwrap_or("")),
                          parsed_headers))
                },
                httparse::Status::Partial => None
            }
        };

        if let Some((consumed, method, path, headers)) = parsed {
            let leftover = buffer.split_off(consumed);
            return Ok((leftover, method, path, headers));
        }

        if buffer.len() >= MAX_HEAD_LENGTH {
            return Err(Error::RequestLineTooLong);
        }
    }
}

#[test]
fn parse_request_basic() {
    let request: &[u8] = b"GET / HTTP/1.1\r\nHost: google.com\r\nUser-Agent: curl/7.47.1\r\nAccept: */*\r\n\r\n";

    let (_, method, path, headers) = parse_inner(request).unwrap();

    assert_eq!(method, "GET");
    assert_eq!(path, "/");
    assert_eq!(headers.get("user-agent").unwrap(), b"curl/7.47.1");
}

#[test]
fn parse_request_does_not_percent_decode() {
    let request: &[u8] = b"GET /%20 HTTP/1.1\r\n\r\n";

    let (_, _, path, _) = parse_inner(request).unwrap();

    assert_eq!(path, "/%20");
}

#[test]
fn parse_request_does_not_fail_on_illegal_percent_decoding() {
    let request: &[u8] = b"GET /bogus%zz HTTP/1.1\r\n\r\n";

    let (_, _, path, _) = parse_inner(request).unwrap();

    assert_eq!(path, "/bogus%zz");
}

#[test]
fn parse_request_fails_on_truncated_head() {
    let request: &[u8] = b"GET /bogon HTTP/1.1\r\n";

    assert!(parse_inner(request).is_err());
}

#[test]
fn parse_request_keeps_body_bytes() {
    let request: &[u8] = b"POST /upload.py HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";

    let (leftover, method, _, _) = parse_inner(request).unwrap();

    assert_eq!(method, "POST");
    assert_eq!(leftover, b"hello");
}

impl Read for Request {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rest.read(buf)
    }
}

impl BufRead for Request {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.rest.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.rest.consume(amt)
    }
}

/// Where the response is in emitting its head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    /// Nothing has been written
    NotStarted,
    /// The status line is out; headers may follow
    StatusEmitted,
    /// The head is finished and only body bytes may be written
    Done
}

/// The response being sent for a request
///
/// The head goes out incrementally. The first `send_header` (or
/// `end_headers`, if there are no headers) commits the status line, so
/// `set_status` only has an effect before then. Body bytes go through the
/// `io::Write` interface and are refused until `end_headers` has been called.
///
/// Every response closes its connection, so bodies need no framing.
pub struct Response {
    writer: BufWriter<Box<dyn Write + Send>>,
    status: ResponseStatus,
    state: HeaderState
}

struct ResponseStatus {
    code: u16,
    reason: String
}

impl Response {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Response {
            writer: BufWriter::new(writer),
            status: ResponseStatus {
                code: 200,
                reason: String::from(reason_phrase(200))
            },
            state: HeaderState::NotStarted
        }
    }

    pub fn set_status(&mut self, code: u16, reason: &str) {
        if self.state != HeaderState::NotStarted {
            warn!("Status {} set after the status line went out", code);
            return;
        }

        self.status = ResponseStatus {
            code: code,
            reason: String::from(reason)
        };
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status.code
    }

    /// Whether anything has been written to the client yet
    #[inline]
    pub fn headers_sent(&self) -> bool {
        self.state != HeaderState::NotStarted
    }

    pub fn send_header(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        if self.state == HeaderState::Done {
            return Err(io::Error::new(io::ErrorKind::Other,
                                      "header sent after end of headers"));
        }

        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                                      format!("bad header name {:?}", name)));
        }

        if value.iter().any(|&b| b == b'\r' || b == b'\n') {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                                      "line break in header value"));
        }

        self.emit_status()?;

        write!(self.writer, "{}: ", name)?;
        self.writer.write_all(value)?;
        self.writer.write_all(b"\r\n")
    }

    pub fn end_headers(&mut self) -> io::Result<()> {
        if self.state == HeaderState::Done {
            return Err(io::Error::new(io::ErrorKind::Other,
                                      "headers ended twice"));
        }

        self.emit_status()?;
        self.writer.write_all(b"Connection: close\r\n\r\n")?;
        self.state = HeaderState::Done;

        Ok(())
    }

    /// Sends the status line and leaves the rest of the head to whatever gets
    /// written next, for output that carries its own headers.
    pub fn hand_off_headers(&mut self) -> io::Result<()> {
        if self.state == HeaderState::Done {
            return Err(io::Error::new(io::ErrorKind::Other,
                                      "headers already ended"));
        }

        self.emit_status()?;
        self.state = HeaderState::Done;

        Ok(())
    }

    fn emit_status(&mut self) -> io::Result<()> {
        if self.state != HeaderState::NotStarted {
            return Ok(());
        }

        write!(self.writer, "{} {} {}\r\nServer: {}\r\n",
               SERVER_PROTOCOL, self.status.code, self.status.reason,
               SERVER_SOFTWARE)?;
        self.state = HeaderState::StatusEmitted;

        Ok(())
    }
}

impl Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state != HeaderState::Done {
            return Err(io::Error::new(io::ErrorKind::Other,
                                      "body written before end of headers"));
        }

        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// `tchar` from RFC 7230
fn is_token_byte(b: u8) -> bool {
    match b {
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' => true,
        b => b.is_ascii_alphanumeric()
    }
}

/// A map of HTTP headers
///
/// Keys are case-normalized on input. The first word, and any words after a
/// hyphen, are capitalized, with all other letters lowercased. Entries keep
/// the order they arrived in, repeats included.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>
}

fn normalize_header_name(name: &str) -> String {
    let lowercased = name.to_ascii_lowercase();
    let mut lower_chars = lowercased.chars();

    let mut normalized = String::with_capacity(lowercased.len());
    if let Some(ch) = lower_chars.next() {
        normalized.push(ch.to_ascii_uppercase());
    }
    else {
        return normalized;
    }

    let mut after_hyphen = false;
    for ch in lower_chars {
        if ch == '-' {
            after_hyphen = true;
            normalized.push(ch);
        }
        else if after_hyphen {
            normalized.push(ch.to_ascii_uppercase());
            after_hyphen = false;
        }
        else {
            normalized.push(ch);
        }
    }

    normalized
}

#[test]
fn normalize_content_type() {
    let expected = "Content-Type";
    assert_eq!(expected, &normalize_header_name("Content-Type"));
    assert_eq!(expected, &normalize_header_name("content-type"));
    assert_eq!(expected, &normalize_header_name("CONTENT-TYPE"));
    assert_eq!(expected, &normalize_header_name("cOnTeNt-TyPe"));
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            entries: Vec::new()
        }
    }

    pub fn insert(&mut self, key: &str, value: Vec<u8>) {
        self.entries.push((normalize_header_name(key), value));
    }

    /// The first value stored under `key`
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        let key = normalize_header_name(key);
        self.entries.iter()
            .find(|&&(ref name, _)| *name == key)
            .map(|&(_, ref value)| &value[..])
    }

    pub fn iter(&self) -> slice::Iter<(String, Vec<u8>)> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a (String, Vec<u8>);
    type IntoIter = slice::Iter<'a, (String, Vec<u8>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[test]
fn headers_keep_arrival_order() {
    let mut headers = Headers::new();
    headers.insert("x-b", Vec::from(&b"2"[..]));
    headers.insert("X-A", Vec::from(&b"1"[..]));
    headers.insert("X-B", Vec::from(&b"3"[..]));

    let names: Vec<&str> = headers.iter().map(|&(ref n, _)| &n[..]).collect();
    assert_eq!(names, vec!["X-B", "X-A", "X-B"]);
    assert_eq!(headers.get("x-b").unwrap(), b"2");
}

/// Translates a strongly-typed Mime type into a string, dropping parameters
pub fn mime_as_string(mime: &Mime) -> String {
    format!("{}/{}", mime.type_(), mime.subtype())
}

#[test]
fn mime_as_string_html() {
    assert_eq!(mime_as_string(&::mime::TEXT_HTML_UTF_8), "text/html");
}

#[test]
fn mime_as_string_css() {
    assert_eq!(mime_as_string(&::mime::TEXT_CSS), "text/css");
}

#[test]
fn mime_as_string_javascript() {
    assert_eq!(mime_as_string(&::mime::TEXT_JAVASCRIPT), "text/javascript");
}

/// The standard reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown"
    }
}

pub mod error_messages {
    use super::{Response, reason_phrase};

    use std::io::{self, Write};

    /// Sends a complete error response with a generic page for `code`.
    ///
    /// Fails if the head of `res` has already started going out.
    pub fn error_page(res: &mut Response, code: u16) -> io::Result<()> {
        if res.headers_sent() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("can't send a {} page, the response already started",
                        code)));
        }

        let body = format!(
            "<!doctype html><html><head><title>Error</title></head><body><h1>{}</h1><p>{}</p></body></html>",
            reason_phrase(code), explanation(code));

        res.set_status(code, reason_phrase(code));
        res.send_header("Content-Type", b"text/html; charset=utf-8")?;
        res.send_header("Content-Length", body.len().to_string().as_bytes())?;
        res.end_headers()?;
        res.write_all(body.as_bytes())
    }

    fn explanation(code: u16) -> &'static str {
        match code {
            400 => "Your request had some kind of bad syntax. Are you using netcat?",
            403 => "You don't have permission to view that file. Sorry.",
            404 => "I couldn't find that file. Sorry.",
            405 => "This resource doesn't understand that method. Sorry about that.",
            504 => "The script took too long to answer. Try again later.",
            _ => "Something went wrong on my side. There's nothing you can do; maybe come back later."
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use super::error_messages::error_page;
    use super::testing::*;

    #[test]
    fn status_goes_out_with_the_first_header() {
        let (mut res, sink) = response();
        res.set_status(201, "Created");
        res.send_header("X-Foo", b"bar").unwrap();
        res.set_status(500, "Ignored");
        res.end_headers().unwrap();
        res.write_all(b"HELLO").unwrap();
        res.flush().unwrap();

        assert_eq!(sink.text(),
                   format!("HTTP/1.1 201 Created\r\nServer: {}\r\nX-Foo: bar\r\n\
                            Connection: close\r\n\r\nHELLO", SERVER_SOFTWARE));
        assert_eq!(res.status_code(), 201);
    }

    #[test]
    fn end_headers_alone_emits_status() {
        let (mut res, sink) = response();
        res.end_headers().unwrap();
        res.flush().unwrap();

        assert!(sink.text().starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(sink.text().ends_with("\r\n\r\n"));
    }

    #[test]
    fn body_before_end_of_headers_is_refused() {
        let (mut res, _) = response();
        assert!(res.write_all(b"early").is_err());

        res.send_header("X-Foo", b"bar").unwrap();
        assert!(res.write_all(b"early").is_err());
    }

    #[test]
    fn header_injection_is_refused() {
        let (mut res, _) = response();
        assert!(res.send_header("X-Foo", b"bar\r\nSet-Cookie: x").is_err());
        assert!(res.send_header("Bad Name", b"x").is_err());
    }

    #[test]
    fn error_page_has_matching_length() {
        let (mut res, sink) = response();
        error_page(&mut res, 504).unwrap();
        res.flush().unwrap();

        let text = sink.text();
        assert!(text.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));

        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let length = format!("Content-Length: {}\r\n", text.len() - body_start);
        assert!(text.contains(&length));
    }

    #[test]
    fn error_page_refuses_after_headers() {
        let (mut res, _) = response();
        res.send_header("X-Foo", b"bar").unwrap();

        assert!(error_page(&mut res, 500).is_err());
    }

    #[test]
    fn request_body_follows_head() {
        let mut req = request(b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        let mut body = Vec::new();
        req.read_to_end(&mut body).unwrap();

        assert_eq!(req.content_length().unwrap(), Some(3));
        assert_eq!(body, b"abc");
    }

    #[test]
    fn bogus_content_length() {
        let req = request(b"POST /x HTTP/1.1\r\nContent-Length: lots\r\n\r\n");

        match req.content_length() {
            Err(Error::BadContentLength) => (),
            other => panic!("{:?}", other)
        }
    }
}
