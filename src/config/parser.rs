use super::*;
use toml::{self, Table, Value};

use std::fs::File;
use std::io::{self, Read};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::u16;

pub fn parse_file<P: AsRef<Path>>(conf: P)
                                  -> Result<Config, Error>
{
    let mut toml = String::new();
    {
        let mut f = File::open(conf)?;
        f.read_to_string(&mut toml)?;
    }

    parse_str(&toml)
}

pub fn parse_str(toml: &str) -> Result<Config, Error> {
    match toml.parse::<Table>() {
        Ok(table) => config_from_table(&table),
        Err(e) => Err(Error::Parse(vec![message_from_error(toml, &e)]))
    }
}

fn config_from_table(table: &Table) -> Result<Config, Error> {
    let mut config: Config = Default::default();

    match lookup(table, "listen.port") {
        Some(&Value::Integer(p))
            if p <= u16::MAX as i64 &&
            p > 0 => config.port = p as u16,
        Some(&Value::Integer(p)) => return Err(Error::Validation(
            format!("The given port {} is out of range", p)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the port to be an integer, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    if let Some(bind) = string(table, "listen.bind")? {
        config.bind = match bind.parse::<IpAddr>() {
            Ok(addr) => addr,
            Err(_) => return Err(Error::Validation(
                format!("The bind address {:?} is not an IP address", bind)
            ))
        };
    }

    if let Some(concurrent) = boolean(table, "listen.concurrent")? {
        config.concurrent = concurrent;
    }

    if let Some(name) = string(table, "listen.server_name")? {
        config.server_name = String::from(name);
    }

    if let Some(path) = string(table, "static.webroot")? {
        config.stat.webroot = PathBuf::from(path);
    }

    if let Some(dirs) = url_paths(table, "cgi.directories")? {
        config.cgi.directories = dirs;
    }

    if let Some(scripts) = url_paths(table, "cgi.scripts")? {
        config.cgi.scripts = scripts;
    }

    if let Some(interpreter) = string(table, "cgi.interpreter")? {
        config.cgi.interpreter = if interpreter.is_empty() {
            None
        }
        else {
            Some(PathBuf::from(interpreter))
        };
    }

    if let Some(secs) = positive_integer(table, "cgi.timeout")? {
        config.cgi.timeout = Duration::from_secs(secs);
    }

    if let Some(size) = positive_integer(table, "cgi.chunk_size")? {
        config.cgi.chunk_size = size as usize;
    }

    match string(table, "cgi.strategy")? {
        Some("auto") => config.cgi.strategy = StrategyChoice::Auto,
        Some("subprocess") => config.cgi.strategy = StrategyChoice::Subprocess,
        Some("native") => config.cgi.strategy = StrategyChoice::Native,
        Some(other) => return Err(Error::Validation(
            format!("Expected cgi.strategy to be \"auto\", \"subprocess\" or \
                     \"native\", got {:?}", other)
        )),
        None => ()
    }

    if let Some(inherit) = boolean(table, "cgi.inherit_env")? {
        config.cgi.inherit_env = inherit;
    }

    match lookup(table, "cgi.env") {
        Some(&Value::Table(ref vars)) => {
            for (name, value) in vars {
                match *value {
                    Value::String(ref s) =>
                        config.cgi.env.push((name.clone(), s.clone())),
                    ref val => return Err(Error::Validation(
                        format!("Expected cgi.env.{} to be a string, got a {}",
                                name, val.type_str())
                    ))
                }
            }
        },
        Some(val) => return Err(Error::Validation(
            format!("Expected cgi.env to be a table, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    Ok(config)
}

/// Follows a dotted key like `"listen.port"` through nested tables
fn lookup<'a>(table: &'a Table, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut value = table.get(parts.next()?)?;

    for part in parts {
        value = value.get(part)?;
    }

    Some(value)
}

fn string<'a>(table: &'a Table, key: &str) -> Result<Option<&'a str>, Error> {
    match lookup(table, key) {
        Some(&Value::String(ref s)) => Ok(Some(&s[..])),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be a string, got a {}",
                    key, val.type_str())
        )),
        None => Ok(None)
    }
}

fn boolean(table: &Table, key: &str) -> Result<Option<bool>, Error> {
    match lookup(table, key) {
        Some(&Value::Boolean(b)) => Ok(Some(b)),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be a boolean, got a {}",
                    key, val.type_str())
        )),
        None => Ok(None)
    }
}

fn positive_integer(table: &Table, key: &str) -> Result<Option<u64>, Error> {
    match lookup(table, key) {
        Some(&Value::Integer(n)) if n > 0 => Ok(Some(n as u64)),
        Some(&Value::Integer(n)) => Err(Error::Validation(
            format!("{} must be greater than zero, got {}", key, n)
        )),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be an integer, got a {}",
                    key, val.type_str())
        )),
        None => Ok(None)
    }
}

/// An array of URL paths. Each must lead with `'/'`; trailing slashes are
/// dropped.
fn url_paths(table: &Table, key: &str) -> Result<Option<Vec<String>>, Error> {
    let array = match lookup(table, key) {
        Some(&Value::Array(ref a)) => a,
        Some(val) => return Err(Error::Validation(
            format!("Expected {} to be an array, got a {}",
                    key, val.type_str())
        )),
        None => return Ok(None)
    };

    let mut paths = Vec::with_capacity(array.len());
    for value in array {
        match *value {
            Value::String(ref s) if s.starts_with('/') && s.len() > 1 =>
                paths.push(String::from(s.trim_end_matches('/'))),
            Value::String(ref s) => return Err(Error::Validation(
                format!("Entries of {} must be absolute URL paths, got {:?}",
                        key, s)
            )),
            ref val => return Err(Error::Validation(
                format!("Expected entries of {} to be strings, got a {}",
                        key, val.type_str())
            ))
        }
    }

    Ok(Some(paths))
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(Vec<ErrorMessage>),
    Validation(String)
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// An owned, rendered version of a TOML syntax error
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize
}

/// Convert a TOML error into an `ErrorMessage`, with 1-based positions
fn message_from_error(source: &str, error: &toml::de::Error) -> ErrorMessage {
    let offset = error.span().map_or(0, |span| span.start);
    let before = &source[.. offset.min(source.len())];

    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(i) => before[i + 1 ..].chars().count() + 1,
        None => before.chars().count() + 1
    };

    ErrorMessage {
        desc: String::from(error.message()),
        line: line,
        column: column
    }
}
