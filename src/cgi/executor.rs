//! Running a script as a child process
//!
//! The request body is collected in full before the child starts. The child
//! gets it on stdin while its stdout and stderr are drained on their own
//! threads, so a chatty script can't wedge against a full pipe. `run` blocks
//! until the child and everything holding its output open are done, or until
//! the timeout kills them.
//!
//! Each child leads its own process group. Whatever a script starts lands in
//! that group, so killing the group on timeout takes its helpers down too.

use cgi::Failure;
use cgi::environment::Environment;

use libc;
use wait_timeout::ChildExt;

use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Everything needed to run one script for one request
#[derive(Debug)]
pub struct Invocation {
    /// The script's real path
    pub script: PathBuf,
    /// Where the script runs; its containing directory
    pub working_dir: PathBuf,
    pub query: String,
    pub method: String,
    /// The script's complete environment
    pub env: Environment,
    /// The request body
    pub input: Vec<u8>
}

/// What a script wrote before exiting
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus
}

/// Reads up to `declared` bytes from `source`, at most `chunk_size` at a time.
///
/// Stops early if the source runs dry or errors out, such as on a socket read
/// timeout. A short body is logged and returned as-is; a client that lies
/// about its length shouldn't hang the request.
pub fn collect_input<R: Read>(mut source: R, declared: u64, chunk_size: usize)
                              -> Vec<u8>
{
    let chunk_size = chunk_size.max(1);
    let mut input = Vec::with_capacity(declared.min(chunk_size as u64) as usize);
    let mut chunk = vec![0u8; chunk_size];
    let mut remaining = declared;

    while remaining > 0 {
        let wanted = remaining.min(chunk_size as u64) as usize;
        match source.read(&mut chunk[.. wanted]) {
            Ok(0) => break,
            Ok(n) => {
                input.extend_from_slice(&chunk[.. n]);
                remaining -= n as u64;
            },
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => {
                warn!("Stopped reading the request body: {}", e);
                break;
            }
        }
    }

    if input.len() as u64 != declared {
        warn!("Expected {} bytes of request body, got {}",
              declared, input.len());
    }

    input
}

/// Sets up the command for an invocation, without any stdio.
///
/// With an `interpreter`, the script is its argument; otherwise the script is
/// executed itself. The child starts a new process group.
pub fn command(invocation: &Invocation, interpreter: Option<&Path>) -> Command {
    let mut command = match interpreter {
        Some(interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(&invocation.script);
            command
        },
        None => Command::new(&invocation.script)
    };

    command.env_clear()
        .envs(&invocation.env)
        .current_dir(&invocation.working_dir)
        .process_group(0);

    command
}

/// Runs a script to completion, killing it if it outlives `timeout`.
///
/// The bound covers the whole run: a script that exits in time but leaves
/// something behind holding its stdout or stderr open still times out.
pub fn run(invocation: Invocation, interpreter: Option<&Path>,
           timeout: Duration) -> Result<ProcessOutput, Failure>
{
    if !invocation.script.exists() {
        return Err(Failure::NotFound);
    }

    let deadline = Instant::now() + timeout;
    let mut child = command(&invocation, interpreter)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Failure::Execution)?;

    debug!("Started {:?} for {} with query {:?} as pid {}",
           invocation.script, invocation.method, invocation.query, child.id());

    let feeder = feed_stdin(child.stdin.take(), invocation.input);
    let (sender, receiver) = mpsc::channel();
    forward_pipe(child.stdout.take(), Stream::Stdout, sender.clone());
    forward_pipe(child.stderr.take(), Stream::Stderr, sender);

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            terminate(&mut child);
            return Err(Failure::Timeout(timeout));
        },
        Err(e) => {
            terminate(&mut child);
            return Err(Failure::Execution(e));
        }
    };

    let mut stdout = None;
    let mut stderr = None;
    while stdout.is_none() || stderr.is_none() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok((Stream::Stdout, output)) =>
                stdout = Some(output.map_err(Failure::Execution)?),
            Ok((Stream::Stderr, output)) =>
                stderr = Some(output.map_err(Failure::Execution)?),
            Err(RecvTimeoutError::Timeout) => {
                warn!("{:?} exited but left processes holding its output open",
                      invocation.script);
                kill_group(&child);
                return Err(Failure::Timeout(timeout));
            },
            Err(RecvTimeoutError::Disconnected) =>
                return Err(Failure::Execution(io::Error::new(
                    io::ErrorKind::Other, "an output reader panicked")))
        }
    }

    // Anything still holding stdin open isn't our problem once the output is in
    if feeder.is_finished() {
        if feeder.join().is_err() {
            warn!("The stdin writer for {:?} panicked", invocation.script);
        }
    }
    else {
        debug!("Leaving the stdin writer for {:?} to finish on its own",
               invocation.script);
    }

    Ok(ProcessOutput {
        stdout: stdout.unwrap_or_else(Vec::new),
        stderr: stderr.unwrap_or_else(Vec::new),
        status: status
    })
}

/// Sends SIGKILL to the process group `child` leads.
///
/// The group outlives its leader for as long as any member is alive, so this
/// still reaches leftovers after the child itself has exited.
pub fn kill_group(child: &Child) {
    let group = child.id() as libc::pid_t;
    if unsafe { libc::killpg(group, libc::SIGKILL) } == 0 {
        return;
    }

    let e = io::Error::last_os_error();
    if e.raw_os_error() != Some(libc::ESRCH) {
        warn!("Couldn't kill process group {}: {}", group, e);
    }
}

/// Kills the child's process group, then reaps the child.
pub fn terminate(child: &mut Child) {
    kill_group(child);
    if let Err(e) = child.wait() {
        warn!("Couldn't reap pid {}: {}", child.id(), e);
    }
}

/// Writes `input` to the child's stdin on its own thread, then closes it.
pub fn feed_stdin(stdin: Option<ChildStdin>, input: Vec<u8>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut stdin = match stdin {
            Some(stdin) => stdin,
            None => return
        };

        match stdin.write_all(&input) {
            Ok(()) => (),
            // Scripts are free to ignore their input
            Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe =>
                debug!("Script closed stdin with input left over"),
            Err(e) => warn!("Couldn't write the request body to a script: {}", e)
        }
    })
}

pub fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>)
                                                   -> Option<JoinHandle<io::Result<Vec<u8>>>>
{
    pipe.map(|pipe| thread::spawn(move || read_pipe(pipe)))
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr
}

/// Drains `pipe` on its own thread and sends the result down `sender`.
fn forward_pipe<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream,
                                          sender: Sender<(Stream, io::Result<Vec<u8>>)>)
{
    thread::spawn(move || {
        let output = match pipe {
            Some(pipe) => read_pipe(pipe),
            None => Ok(Vec::new())
        };

        // Nobody's listening after a timeout
        let _ = sender.send((stream, output));
    });
}

fn read_pipe<R: Read>(mut pipe: R) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    pipe.read_to_end(&mut buffer)?;
    Ok(buffer)
}
