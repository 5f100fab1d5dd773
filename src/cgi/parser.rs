//! Parsers for CGI/1.1 responses
//!
//! A script's output is an optional header block, a blank line, and a body.
//! Output with no blank line anywhere is all body.

use cgi::{CgiResponse, Header, Status};
use log_util::ascii_escape;
use server::Response;

use mime;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{digit1, space1};
use nom::combinator::{eof, map_res, rest};
use nom::sequence::{separated_pair, terminated};

use std::io::{self, Write};
use std::str::{self, FromStr};

/// Why a script's output couldn't be turned into a response
#[derive(Debug, PartialEq, Eq)]
pub enum OutputError {
    /// Nothing at all on stdout
    Empty,
    /// A header value would have broken the response head
    Malformed(String)
}

/// Splits `output` at the first blank line.
///
/// A `\r\n\r\n` separator is preferred; `\n\n` only counts when there's no
/// `\r\n\r\n` anywhere.
pub fn split_document(output: &[u8]) -> Option<(&[u8], &[u8])> {
    find(output, b"\r\n\r\n")
        .map(|i| (&output[.. i], &output[i + 4 ..]))
        .or_else(|| find(output, b"\n\n")
                 .map(|i| (&output[.. i], &output[i + 2 ..])))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Parses a script's complete stdout.
pub fn parse_output(output: &[u8]) -> Result<CgiResponse, OutputError> {
    if output.is_empty() {
        return Err(OutputError::Empty);
    }

    let (head, body) = match split_document(output) {
        Some(parts) => parts,
        None => return Ok(CgiResponse {
            status: Status { code: 200, reason_phrase: None },
            headers: vec![Header {
                name: String::from("Content-Type"),
                content: Vec::from(mime::TEXT_HTML.as_ref().as_bytes())
            }],
            body: Vec::from(output)
        })
    };

    let mut status = Status { code: 200, reason_phrase: None };
    let mut headers = Vec::new();

    for line in head.split(|&b| b == b'\n').map(trim).filter(|l| !l.is_empty()) {
        let (name, content) = match header(line) {
            Ok((_, (name, content))) => (trim(name), trim(content)),
            Err(_) => {
                warn!("Skipping script header line without a colon: \"{}\"",
                      ascii_escape(line));
                continue;
            }
        };

        let name = match str::from_utf8(name) {
            Ok(name) if !name.is_empty() && name.bytes().all(is_token_byte) =>
                name,
            _ => {
                warn!("Skipping script header with a bad name: \"{}\"",
                      ascii_escape(line));
                continue;
            }
        };

        if content.contains(&b'\r') {
            return Err(OutputError::Malformed(
                format!("stray carriage return in header {}", name)));
        }

        if name.eq_ignore_ascii_case("status") {
            status = parse_status(content);
        }
        else {
            headers.push(Header {
                name: String::from(name),
                content: Vec::from(content)
            });
        }
    }

    Ok(CgiResponse {
        status: status,
        headers: headers,
        body: Vec::from(body)
    })
}

/// Reads the value of a `Status` header.
///
/// Falls back to 200 when the leading token isn't a three-digit code.
pub fn parse_status(value: &[u8]) -> Status {
    match status_code(value) {
        Ok((reason, code)) if code >= 100 && code <= 999 => {
            let reason = trim(reason);
            Status {
                code: code,
                reason_phrase: if reason.is_empty() {
                    None
                }
                else {
                    Some(Vec::from(reason))
                }
            }
        },
        _ => {
            warn!("Unparsable Status header \"{}\" from a script, using 200",
                  ascii_escape(value));
            Status { code: 200, reason_phrase: None }
        }
    }
}

fn status_code(input: &[u8]) -> IResult<&[u8], u16> {
    terminated(
        map_res(map_res(digit1, str::from_utf8), u16::from_str),
        alt((space1, eof))
    )(input)
}

fn header(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    separated_pair(take_till1(is_colon), tag(":"), rest)(input)
}

fn is_colon(x: u8) -> bool {
    x == b':'
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);

    &bytes[start .. end]
}

/// Sends a parsed script response to the client.
///
/// The script's headers go out in the order it wrote them; the body is
/// written untouched.
pub fn emit(response: &CgiResponse, res: &mut Response) -> io::Result<()> {
    let reason = match response.status.reason_phrase {
        Some(ref reason) => String::from_utf8_lossy(reason).into_owned(),
        None => String::from(::server::reason_phrase(response.status.code))
    };
    res.set_status(response.status.code, &reason);

    for header in &response.headers {
        // Every response closes its connection; the server says so itself
        if header.name.eq_ignore_ascii_case("connection") {
            debug!("Dropping a script's Connection header");
            continue;
        }

        res.send_header(&header.name, &header.content)?;
    }

    res.end_headers()?;
    res.write_all(&response.body)
}
