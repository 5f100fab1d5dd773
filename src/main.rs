//! A small Web server that runs CGI scripts.
//!
//! Call it like this:
//!
//!     cgi-server -f config.toml [PORT]
//!
//! The config file is in the [TOML format][toml] because it’s commonly used in
//! the Rust ecosystem. Here is an example:
//!
//! ```toml
//! [listen]
//! bind = "0.0.0.0"
//! port = 8080
//! concurrent = false
//! server_name = "localhost"
//!
//! [static]
//! webroot = "."
//!
//! [cgi]
//! directories = ["/cgi-bin"]
//! scripts = ["/upload.py"]
//! interpreter = "python3"
//! timeout = 600
//! chunk_size = 65536
//! strategy = "auto"
//! inherit_env = true
//!
//! [cgi.env]
//! UPLOAD_DIR = "/var/uploads"
//! ```
//!
//! These are also the defaults if no config file is provided, or any given key
//! is not present (except `[cgi.env]`, which is empty). If a key is of the
//! wrong type, the server will bail, so don’t do that.
//!
//! Paths under one of the `directories`, and the exact paths in `scripts`, are
//! run as CGI/1.1 scripts. Everything else is served as a static file from the
//! web root, GET and HEAD only.
//!
//! `strategy` picks how scripts run. `subprocess` buffers a script's output,
//! parses it, and kills scripts that outlive `timeout`. `native` relays output
//! straight to the client the way a classic CGI handler does. `auto` takes
//! `subprocess` only on hosts where exec-ing from the server is known to
//! misbehave.
//!
//! [toml]: https://github.com/toml-lang/toml

extern crate clap;
extern crate env_logger;
extern crate httparse;
extern crate libc;
#[macro_use] extern crate log;
extern crate mime;
extern crate mime_guess;
extern crate nom;
extern crate toml;
extern crate wait_timeout;

#[cfg(test)] extern crate tempfile;

mod cgi;
mod config;
mod errors;
mod filesystem;
mod log_util;
mod server;

use config::Config;
use config::parser::{self, parse_file};
use server::serve;

use clap::{Arg, App};

use std::env;
use std::fs;
use std::net::IpAddr;
use std::process::exit;

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(log::LevelFilter::Info);

    if let Ok(var) = env::var("SERVER_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        eprintln!("cgi-server: Error when initializing logging: {}", e);
        exit(1);
    }

    if env::var_os("REQUEST_METHOD").is_some() {
        error!("REQUEST_METHOD is set; refusing to run as a CGI script");
        exit(1);
    }

    let matches = App::new("cgi-server")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Alex Hill <alexander.d.hill.89@gmail.com>")
        .arg(Arg::with_name("config_file")
             .short("f")
             .value_name("FILE")
             .help("The TOML file with server configuration")
             .takes_value(true))
        .arg(Arg::with_name("bind")
             .short("b")
             .long("bind")
             .value_name("ADDRESS")
             .help("Address to listen on, overriding the config file")
             .takes_value(true))
        .arg(Arg::with_name("port")
             .value_name("PORT")
             .help("Port to listen on, overriding the config file")
             .index(1))
        .get_matches();

    let mut config = match matches.value_of_os("config_file") {
        Some(config_file) => load_config(config_file),
        None => Config::default()
    };

    if let Some(bind) = matches.value_of("bind") {
        config.bind = match bind.parse::<IpAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                error!("The bind address {:?} is not an IP address", bind);
                exit(1);
            }
        };
    }

    if let Some(port) = matches.value_of("port") {
        config.port = match port.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                error!("The port {:?} is not a valid port number", port);
                exit(1);
            }
        };
    }

    let strategy = config.cgi.strategy.resolve(exec_defect_present);
    info!("Starting server on {} port {}, running scripts with the {:?} strategy",
          config.bind, config.port, strategy);

    if let Err(e) = serve(config, strategy) {
        error!("Server stopped: {}", e);
        exit(1);
    }
}

fn load_config(config_file: &::std::ffi::OsStr) -> Config {
    match parse_file(config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Parse(e)) => {
            error!("Errors parsing config file {:?}", config_file);
            for error in e {
                error!("Config file error at line {} column {}: {}",
                       error.line, error.column, error.desc);
            }
            exit(1);
        },
        Err(parser::Error::Validation(message)) => {
            error!("Error in config file: {}", message);
            exit(1);
        }
    }
}

/// Whether this host is one where a server fork-and-exec-ing its scripts
/// directly is broken. So far that means the Windows Subsystem for Linux.
fn exec_defect_present() -> bool {
    match fs::read_to_string("/proc/version") {
        Ok(version) => {
            let version = version.to_ascii_lowercase();
            version.contains("microsoft") || version.contains("wsl")
        },
        Err(_) => false
    }
}
