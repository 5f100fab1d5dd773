pub mod parser;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// A holder for app configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind
    pub bind: IpAddr,
    /// Port number to listen on
    pub port: u16,
    /// Handle each connection on its own thread
    pub concurrent: bool,
    /// Reported to scripts as `SERVER_NAME`
    pub server_name: String,
    pub stat: StaticFilesConfig,
    pub cgi: CgiConfig
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            concurrent: false,
            server_name: String::from("localhost"),
            stat: Default::default(),
            cgi: Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaticFilesConfig {
    /// Where the files are located on disk
    pub webroot: PathBuf
}

impl Default for StaticFilesConfig {
    fn default() -> StaticFilesConfig {
        StaticFilesConfig {
            webroot: PathBuf::from(".")
        }
    }
}

#[derive(Debug, Clone)]
pub struct CgiConfig {
    /// URL directories whose contents are all scripts, like `/cgi-bin`
    pub directories: Vec<String>,
    /// Top-level scripts reachable outside any CGI directory, like
    /// `/upload.py`
    pub scripts: Vec<String>,
    /// Program that runs the scripts; `None` executes them directly
    pub interpreter: Option<PathBuf>,
    /// Hard bound on a script's running time
    pub timeout: Duration,
    /// Largest single read when collecting a request body
    pub chunk_size: usize,
    pub strategy: StrategyChoice,
    /// Start scripts off with the server's own environment
    pub inherit_env: bool,
    /// Fixed variables for every script, beneath the request meta-variables
    pub env: Vec<(String, String)>
}

impl Default for CgiConfig {
    fn default() -> CgiConfig {
        CgiConfig {
            directories: vec![String::from("/cgi-bin")],
            scripts: vec![String::from("/upload.py")],
            interpreter: Some(PathBuf::from("python3")),
            timeout: Duration::from_secs(600),
            chunk_size: 64 * 1024,
            strategy: StrategyChoice::Auto,
            inherit_env: true,
            env: Vec::new()
        }
    }
}

/// The `cgi.strategy` setting, before startup resolves `Auto`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyChoice {
    Auto,
    Subprocess,
    Native
}

/// How scripts get executed. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStrategy {
    /// Buffer the script's output, parse it, and enforce the timeout. Works
    /// around hosts where fork-then-exec from the server misbehaves.
    Subprocess,
    /// Hand the script's output to the client as it comes
    Native
}

impl StrategyChoice {
    /// Settles on a strategy. `exec_defect` is only consulted for `Auto`.
    pub fn resolve<F: FnOnce() -> bool>(self, exec_defect: F) -> ExecStrategy {
        match self {
            StrategyChoice::Subprocess => ExecStrategy::Subprocess,
            StrategyChoice::Native => ExecStrategy::Native,
            StrategyChoice::Auto => {
                if exec_defect() {
                    ExecStrategy::Subprocess
                }
                else {
                    ExecStrategy::Native
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn auto_follows_the_probe() {
        assert_eq!(StrategyChoice::Auto.resolve(|| true), ExecStrategy::Subprocess);
        assert_eq!(StrategyChoice::Auto.resolve(|| false), ExecStrategy::Native);
    }

    #[test]
    fn explicit_choice_skips_the_probe() {
        let strategy = StrategyChoice::Native.resolve(|| panic!("probed"));
        assert_eq!(strategy, ExecStrategy::Native);
    }
}
