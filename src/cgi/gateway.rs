//! The two ways of running a script
//!
//! `SubprocessGateway` buffers everything: it runs the script under a time
//! limit, parses its output, and only then answers the client. It exists for
//! hosts where a server forking and exec-ing its scripts directly is broken.
//! `NativeGateway` is the classic CGI handler: it announces success up front
//! and relays the script's output, headers and all, as it's produced.

use cgi::Failure;
use cgi::executor::{self, Invocation, feed_stdin, spawn_pipe_reader};
use cgi::parser::{emit, parse_output, OutputError};
use config::{CgiConfig, ExecStrategy};
use log_util::escape_preview;
use server::Response;

use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Runs an invocation and answers the client with the script's response
pub trait Gateway: Send + Sync {
    fn run(&self, invocation: Invocation, res: &mut Response)
           -> Result<(), Failure>;
}

/// Picks the gateway for a startup-resolved strategy
pub fn for_strategy(strategy: ExecStrategy, config: &CgiConfig)
                    -> Box<dyn Gateway>
{
    match strategy {
        ExecStrategy::Subprocess => Box::new(SubprocessGateway {
            interpreter: config.interpreter.clone(),
            timeout: config.timeout
        }),
        ExecStrategy::Native => Box::new(NativeGateway {
            interpreter: config.interpreter.clone()
        })
    }
}

pub struct SubprocessGateway {
    pub interpreter: Option<PathBuf>,
    pub timeout: Duration
}

impl Gateway for SubprocessGateway {
    fn run(&self, invocation: Invocation, res: &mut Response)
           -> Result<(), Failure>
    {
        let script = invocation.script.clone();
        let output = executor::run(invocation,
                                   self.interpreter.as_ref().map(|p| p.as_path()),
                                   self.timeout)?;

        if !output.status.success() {
            info!("{:?} exited with {}", script, output.status);
        }

        let response = match parse_output(&output.stdout) {
            Ok(response) => response,
            Err(OutputError::Empty) =>
                return Err(Failure::EmptyOutput { stderr: output.stderr }),
            Err(OutputError::Malformed(why)) => {
                log_stderr(&script, &output.stderr);
                return Err(Failure::MalformedOutput(why));
            }
        };

        log_stderr(&script, &output.stderr);
        emit(&response, res).map_err(Failure::Client)
    }
}

pub struct NativeGateway {
    pub interpreter: Option<PathBuf>
}

impl Gateway for NativeGateway {
    fn run(&self, invocation: Invocation, res: &mut Response)
           -> Result<(), Failure>
    {
        if !invocation.script.exists() {
            return Err(Failure::NotFound);
        }

        let interpreter = if is_executable(&invocation.script) {
            None
        }
        else {
            match self.interpreter {
                Some(ref interpreter) => Some(interpreter.as_path()),
                None => return Err(Failure::NotExecutable)
            }
        };

        let mut child = executor::command(&invocation, interpreter)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Failure::Execution)?;

        let feeder = feed_stdin(child.stdin.take(), invocation.input);
        let stderr = spawn_pipe_reader(child.stderr.take());

        res.set_status(200, "Script output follows");
        let relayed = match child.stdout.take() {
            Some(mut stdout) => relay(&mut stdout, res),
            None => Err(io::Error::new(io::ErrorKind::Other,
                                       "child has no stdout"))
        };

        if let Err(e) = relayed {
            executor::terminate(&mut child);
            return Err(Failure::Client(e));
        }

        let status = child.wait().map_err(Failure::Execution)?;
        if !status.success() {
            info!("{:?} exited with {}", invocation.script, status);
        }

        if feeder.join().is_err() {
            warn!("The stdin writer for {:?} panicked", invocation.script);
        }
        if let Some(Ok(Ok(errors))) = stderr.map(|h| h.join()) {
            log_stderr(&invocation.script, &errors);
        }

        Ok(())
    }
}

/// Copies raw script output to the client behind the status line
fn relay<R: Read>(stdout: &mut R, res: &mut Response) -> io::Result<u64> {
    res.hand_off_headers()?;
    io::copy(stdout, res)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn log_stderr(script: &Path, stderr: &[u8]) {
    if !stderr.is_empty() {
        warn!("CGI stderr from {:?}: {}", script, escape_preview(stderr));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cgi::environment::Environment;
    use server::testing::response;

    use std::fs;
    use std::io::Write;
    use std::time::Instant;

    use tempfile::{tempdir, TempDir};

    fn invocation(dir: &TempDir, script: &str) -> Invocation {
        let root = fs::canonicalize(dir.path()).unwrap();
        let path = root.join("script.sh");
        fs::write(&path, script).unwrap();

        let mut env = Environment::new();
        env.insert(String::from("PATH"), String::from("/usr/bin:/bin"));

        Invocation {
            script: path,
            working_dir: root,
            query: String::new(),
            method: String::from("GET"),
            env: env,
            input: Vec::new()
        }
    }

    fn subprocess(timeout: Duration) -> SubprocessGateway {
        SubprocessGateway {
            interpreter: Some(PathBuf::from("/bin/sh")),
            timeout: timeout
        }
    }

    #[test]
    fn subprocess_relays_parsed_output() {
        let dir = tempdir().unwrap();
        let inv = invocation(&dir, "printf 'Status: 201 Created\\r\\nX-Foo: bar\\r\\n\\r\\nHELLO'\n");
        let (mut res, sink) = response();

        subprocess(Duration::from_secs(10)).run(inv, &mut res).unwrap();
        res.flush().unwrap();

        let text = sink.text();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"), "{}", text);
        assert!(text.contains("X-Foo: bar\r\n"));
        assert!(text.ends_with("\r\n\r\nHELLO"));
        assert_eq!(res.status_code(), 201);
    }

    #[test]
    fn subprocess_empty_output_keeps_stderr() {
        let dir = tempdir().unwrap();
        let inv = invocation(&dir, "echo 'went wrong' >&2\n");
        let (mut res, sink) = response();

        match subprocess(Duration::from_secs(10)).run(inv, &mut res) {
            Err(Failure::EmptyOutput { stderr }) =>
                assert_eq!(stderr, b"went wrong\n"),
            other => panic!("{:?}", other)
        }
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn subprocess_timeout() {
        let dir = tempdir().unwrap();
        let inv = invocation(&dir, "sleep 30\n");
        let (mut res, _) = response();

        let started = Instant::now();
        match subprocess(Duration::from_millis(300)).run(inv, &mut res) {
            Err(Failure::Timeout(_)) => (),
            other => panic!("{:?}", other)
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!res.headers_sent());
    }

    #[test]
    fn native_passes_output_through() {
        let dir = tempdir().unwrap();
        let inv = invocation(&dir, "printf 'Content-Type: text/plain\\r\\n\\r\\nhi'\n");
        let gateway = NativeGateway { interpreter: Some(PathBuf::from("/bin/sh")) };
        let (mut res, sink) = response();

        gateway.run(inv, &mut res).unwrap();
        res.flush().unwrap();

        let text = sink.text();
        assert!(text.starts_with("HTTP/1.1 200 Script output follows\r\n"));
        assert!(text.ends_with("Content-Type: text/plain\r\n\r\nhi"));
    }

    #[test]
    fn native_runs_executable_scripts_directly() {
        let dir = tempdir().unwrap();
        let inv = invocation(&dir, "#!/bin/sh\nprintf 'X-Direct: yes\\n\\n'\n");
        let mut perms = fs::metadata(&inv.script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&inv.script, perms).unwrap();

        let gateway = NativeGateway { interpreter: None };
        let (mut res, sink) = response();

        gateway.run(inv, &mut res).unwrap();
        res.flush().unwrap();

        assert!(sink.text().contains("X-Direct: yes"));
    }

    #[test]
    fn native_refuses_non_executable_without_interpreter() {
        let dir = tempdir().unwrap();
        let inv = invocation(&dir, "echo hi\n");
        let mut perms = fs::metadata(&inv.script).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&inv.script, perms).unwrap();

        let gateway = NativeGateway { interpreter: None };
        let (mut res, _) = response();

        match gateway.run(inv, &mut res) {
            Err(Failure::NotExecutable) => (),
            other => panic!("{:?}", other)
        }
    }
}
