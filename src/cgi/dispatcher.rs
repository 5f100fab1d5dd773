//! The request handler the server runs everything through

use cgi::Failure;
use cgi::environment::{self, Environment, ServerIdentity, is_write_method};
use cgi::executor::{collect_input, Invocation};
use cgi::gateway::{self, Gateway};
use cgi::router::{locate_script, CgiRouter, CgiTarget};
use config::{Config, ExecStrategy};
use filesystem::collapse;
use log_util::escape_preview;
use server::{Handler, Request, Response, SERVER_PROTOCOL, SERVER_SOFTWARE};
use server::error_messages::error_page;
use server::static_files::Statics;

use std::env;
use std::path::{Path, PathBuf};

/// Sends CGI requests through a gateway and everything else to the static
/// file handler
pub struct Dispatcher {
    router: CgiRouter,
    webroot: PathBuf,
    identity: ServerIdentity,
    chunk_size: usize,
    /// Variables every script starts with, before the request's own
    base_env: Vec<(String, String)>,
    gateway: Box<dyn Gateway>,
    statics: Statics
}

impl Dispatcher {
    /// `strategy` is settled once, before the first request, and never
    /// changes for the life of the dispatcher.
    pub fn new(config: &Config, strategy: ExecStrategy) -> Dispatcher {
        let mut base_env = Vec::new();
        if config.cgi.inherit_env {
            base_env.extend(env::vars_os().filter_map(|(name, value)| {
                match (name.into_string(), value.into_string()) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => None
                }
            }));
        }
        base_env.extend(config.cgi.env.iter().cloned());

        Dispatcher {
            router: CgiRouter::new(config.cgi.directories.clone(),
                                   config.cgi.scripts.clone()),
            webroot: config.stat.webroot.clone(),
            identity: ServerIdentity {
                software: String::from(SERVER_SOFTWARE),
                name: config.server_name.clone(),
                port: config.port,
                protocol: String::from(SERVER_PROTOCOL)
            },
            chunk_size: config.cgi.chunk_size,
            base_env: base_env,
            gateway: gateway::for_strategy(strategy, &config.cgi),
            statics: Statics::new(config.stat.webroot.clone())
        }
    }

    fn run_cgi(&self, req: &mut Request, res: &mut Response, target: CgiTarget)
               -> Result<(), Failure>
    {
        debug!("CGI request for {} under {:?}", target.script_identity(),
               target.dir);
        let script = locate_script(&self.webroot, &target)?;
        let query = target.query.unwrap_or_else(String::new);

        let input = if is_write_method(req.method()) {
            match req.content_length() {
                Ok(Some(length)) if length > 0 =>
                    collect_input(&mut *req, length, self.chunk_size),
                Ok(_) => Vec::new(),
                Err(e) => return Err(Failure::BadRequest(e.to_string()))
            }
        }
        else {
            Vec::new()
        };

        let mut env: Environment = self.base_env.iter().cloned().collect();
        env.extend(environment::build(req, &script, &query, &self.identity));

        let working_dir = script.file.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.webroot.clone());

        let invocation = Invocation {
            script: script.file,
            working_dir: working_dir,
            query: query,
            method: String::from(req.method()),
            env: env,
            input: input
        };

        self.gateway.run(invocation, res)
    }
}

impl Handler for Dispatcher {
    fn serve(&self, req: &mut Request, res: &mut Response) {
        let path = match collapse(req.request_uri()) {
            Ok(path) => path,
            Err(e) => {
                info!("Refusing {:?}: {}", req.request_uri(), e);
                if let Err(e) = error_page(res, 400) {
                    warn!("Couldn't send a 400 page: {}", e);
                }
                return;
            }
        };

        match self.router.classify(&path) {
            Some(target) => {
                if let Err(failure) = self.run_cgi(req, res, target) {
                    report(failure, res);
                }
            },
            None => {
                if let Err(e) = self.statics.serve(req, res) {
                    warn!("Error serving a file: {}", e);
                }
            }
        }
    }
}

/// Logs a failed CGI request and tells the client, if there's still time.
fn report(failure: Failure, res: &mut Response) {
    match failure {
        Failure::EmptyOutput { ref stderr } if !stderr.is_empty() =>
            error!("{}; stderr: {}", failure, escape_preview(stderr)),
        Failure::BadRequest(_) | Failure::NotFound | Failure::NotAFile =>
            info!("{}", failure),
        _ => error!("{}", failure)
    }

    let code = match failure.status() {
        Some(code) => code,
        None => return
    };

    if res.headers_sent() {
        warn!("Response already started, dropping the {} for it", code);
        return;
    }

    if let Err(e) = error_page(res, code) {
        warn!("Couldn't send a {} page: {}", code, e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use config::StrategyChoice;
    use server::testing::{request, response};

    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::symlink;
    use std::time::{Duration, Instant};

    use tempfile::{tempdir, TempDir};

    fn site(scripts: &[(&str, &str)]) -> (TempDir, Config) {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir(root.join("cgi-bin")).unwrap();
        fs::write(root.join("index.html"), b"<p>home</p>").unwrap();

        for &(name, body) in scripts {
            fs::write(root.join(name), body).unwrap();
        }

        let mut config = Config::default();
        config.stat.webroot = root;
        config.cgi.scripts = vec![String::from("/upload.sh")];
        config.cgi.interpreter = Some(PathBuf::from("/bin/sh"));
        config.cgi.timeout = Duration::from_secs(10);
        config.cgi.strategy = StrategyChoice::Subprocess;

        (dir, config)
    }

    fn exchange(config: &Config, strategy: ExecStrategy, raw: &[u8]) -> String {
        let dispatcher = Dispatcher::new(config, strategy);
        let mut req = request(raw);
        let (mut res, sink) = response();

        dispatcher.serve(&mut req, &mut res);
        res.flush().unwrap();

        sink.text()
    }

    fn subprocess(config: &Config, raw: &[u8]) -> String {
        exchange(config, ExecStrategy::Subprocess, raw)
    }

    #[test]
    fn upload_round_trip() {
        let (_dir, config) = site(&[(
            "upload.sh",
            "printf 'Status: 201 Created\\r\\nX-Foo: bar\\r\\n\\r\\n'\n\
             printf '%s|%s|%s|' \"$QUERY_STRING\" \"$CONTENT_LENGTH\" \"$HTTP_X_TEST\"\n\
             cat\n"
        )]);

        let text = subprocess(&config, b"POST /upload.sh?job=7 HTTP/1.1\r\n\
                                         Content-Length: 5\r\nX-Test: abc\r\n\r\nhello");

        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"), "{}", text);
        assert!(text.contains("\r\nX-Foo: bar\r\n"));
        assert!(text.ends_with("\r\n\r\njob=7|5|abc|hello"));
    }

    #[test]
    fn script_location_variables() {
        let (_dir, config) = site(&[(
            "cgi-bin/where.sh",
            "printf 'Content-Type: text/plain\\n\\n'\n\
             printf '%s %s %s' \"$SCRIPT_NAME\" \"$PATH_INFO\" \"$(pwd)\"\n"
        )]);
        let cgi_dir = config.stat.webroot.join("cgi-bin");

        let text = subprocess(&config, b"GET /cgi-bin/where.sh/extra/bits HTTP/1.1\r\n\r\n");

        let expected = format!("/cgi-bin/where.sh /extra/bits {}", cgi_dir.display());
        assert!(text.ends_with(&expected), "{}", text);
    }

    #[test]
    fn configured_variables_reach_the_script() {
        let (_dir, mut config) = site(&[(
            "cgi-bin/env.sh",
            "printf 'Content-Type: text/plain\\n\\n%s' \"$UPLOAD_ROOT\"\n"
        )]);
        config.cgi.env = vec![(String::from("UPLOAD_ROOT"), String::from("/srv/up"))];

        let text = subprocess(&config, b"GET /cgi-bin/env.sh HTTP/1.1\r\n\r\n");

        assert!(text.ends_with("\r\n\r\n/srv/up"));
    }

    #[test]
    fn missing_script_is_404() {
        let (_dir, config) = site(&[]);
        let text = subprocess(&config, b"GET /cgi-bin/nope.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn empty_output_is_500() {
        let (_dir, config) = site(&[("cgi-bin/quiet.sh", "echo 'nothing to say' >&2\n")]);
        let text = subprocess(&config, b"GET /cgi-bin/quiet.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!text.contains("nothing to say"));
    }

    #[test]
    fn stray_header_lines_are_skipped() {
        let (_dir, config) = site(&[(
            "cgi-bin/sloppy.sh",
            "printf 'Content-Type: text/plain\\nwhat is this\\n\\nbody'\n"
        )]);
        let text = subprocess(&config, b"GET /cgi-bin/sloppy.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(!text.contains("what is this"));
        assert!(text.ends_with("\r\n\r\nbody"));
    }

    #[test]
    fn header_splitting_output_is_500() {
        let (_dir, config) = site(&[(
            "cgi-bin/bad.sh",
            "printf 'X-A: one\\rSet-Cookie: two\\n\\nbody'\n"
        )]);
        let text = subprocess(&config, b"GET /cgi-bin/bad.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!text.contains("Set-Cookie"));
    }

    #[test]
    fn symlinked_script_runs_as_its_real_file() {
        let (dir, config) = site(&[(
            "target.sh",
            "printf 'Content-Type: text/plain\\n\\n%s %s' \"$SCRIPT_NAME\" \"$PATH_TRANSLATED\"\n"
        )]);
        let real = config.stat.webroot.join("target.sh");
        symlink(&real, dir.path().join("cgi-bin/link.sh")).unwrap();

        let text = subprocess(&config, b"GET /cgi-bin/link.sh HTTP/1.1\r\n\r\n");

        let expected = format!("\r\n\r\n/cgi-bin/link.sh {}", real.display());
        assert!(text.ends_with(&expected), "{}", text);
    }

    #[test]
    fn slow_script_is_504() {
        let (_dir, mut config) = site(&[("cgi-bin/slow.sh", "sleep 30\n")]);
        config.cgi.timeout = Duration::from_millis(300);

        let started = Instant::now();
        let text = subprocess(&config, b"GET /cgi-bin/slow.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn short_body_still_completes() {
        let (_dir, config) = site(&[(
            "upload.sh",
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\ncat\n"
        )]);

        let text = subprocess(&config, b"POST /upload.sh HTTP/1.1\r\n\
                                         Content-Length: 10\r\n\r\nhello");

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn bogus_content_length_is_400() {
        let (_dir, config) = site(&[("upload.sh", "cat\n")]);
        let text = subprocess(&config, b"POST /upload.sh HTTP/1.1\r\n\
                                         Content-Length: -3\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn escaping_the_root_is_400() {
        let (_dir, config) = site(&[]);
        let text = subprocess(&config, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn other_paths_go_to_static_files() {
        let (_dir, config) = site(&[]);
        let text = subprocess(&config, b"GET /index.html HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.ends_with("<p>home</p>"));
    }

    #[test]
    fn native_strategy_passes_output_through() {
        let (_dir, config) = site(&[(
            "cgi-bin/hi.sh",
            "printf 'Content-Type: text/plain\\r\\n\\r\\nhi'\n"
        )]);
        let text = exchange(&config, ExecStrategy::Native,
                            b"GET /cgi-bin/hi.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 200 Script output follows\r\n"));
        assert!(text.ends_with("Content-Type: text/plain\r\n\r\nhi"));
    }

    #[test]
    fn native_strategy_still_404s() {
        let (_dir, config) = site(&[]);
        let text = exchange(&config, ExecStrategy::Native,
                            b"GET /cgi-bin/nope.sh HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
