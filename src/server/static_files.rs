//! Handlers for static file service

use super::{Request, Response, mime_as_string};
use super::error_messages::error_page;
use errors::*;
use filesystem::translate_path;

use mime_guess;

use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

/// Serves whatever isn't a script straight out of the web root
#[derive(Debug, Clone)]
pub struct Statics {
    webroot: PathBuf
}

impl Statics {
    /// `webroot` should already be canonical, or nothing will ever be found
    /// inside it.
    pub fn new(webroot: PathBuf) -> Statics {
        Statics { webroot: webroot }
    }

    /// Answers a GET or HEAD for a file under the web root.
    ///
    /// A directory is served through its `index.html`; there are no listings.
    pub fn serve(&self, req: &Request, res: &mut Response) -> Result<()> {
        let head_only = match req.method() {
            "GET" => false,
            "HEAD" => true,
            _ => {
                error_page(res, 405)?;
                return Err(Error::MethodNotAllowed);
            }
        };

        let mut requested_file = match translate_path(&self.webroot,
                                                      req.request_uri()) {
            Ok(f) => f,
            Err(e) => {
                error_page(res, 400)?;
                return Err(e);
            }
        };

        if !requested_file.starts_with(&self.webroot) {
            error_page(res, 403)?;
            return Err(Error::PermissionDenied);
        }

        if requested_file.is_dir() {
            requested_file.push("index.html");
            if !requested_file.is_file() {
                error_page(res, 403)?;
                return Err(Error::PermissionDenied);
            }
        }

        let file = match File::open(&requested_file) {
            Ok(f) => f,
            Err(e) => {
                match e.kind() {
                    ErrorKind::NotFound => error_page(res, 404)?,
                    ErrorKind::PermissionDenied => error_page(res, 403)?,
                    _ => error_page(res, 500)?
                };

                return Err(Error::from(e));
            }
        };

        let meta = match file.metadata() {
            Ok(m) => m,
            Err(e) => {
                error_page(res, 500)?;
                return Err(Error::from(e));
            }
        };

        if !meta.is_file() {
            error_page(res, 403)?;
            return Err(Error::PermissionDenied);
        }

        let mime = mime_guess::from_path(&requested_file).first_or_octet_stream();

        res.send_header("Content-Type", mime_as_string(&mime).as_bytes())?;
        res.send_header("Content-Length", meta.len().to_string().as_bytes())?;
        res.end_headers()?;

        if !head_only {
            let mut file = file;
            io::copy(&mut file, res)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use server::testing::{request, response};

    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::symlink;

    use tempfile::{tempdir, TempDir};

    fn site() -> (TempDir, Statics) {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::write(root.join("hello.txt"), b"hello there").unwrap();
        fs::create_dir(root.join("docs")).unwrap();
        fs::write(root.join("docs/index.html"), b"<p>docs</p>").unwrap();
        fs::create_dir(root.join("empty")).unwrap();

        (dir, Statics::new(root))
    }

    fn get(statics: &Statics, raw: &[u8]) -> (Result<()>, String) {
        let req = request(raw);
        let (mut res, sink) = response();
        let result = statics.serve(&req, &mut res);
        res.flush().unwrap();

        (result, sink.text())
    }

    #[test]
    fn serves_a_file() {
        let (_dir, statics) = site();
        let (result, text) = get(&statics, b"GET /hello.txt HTTP/1.1\r\n\r\n");

        assert!(result.is_ok());
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\nhello there"));
    }

    #[test]
    fn head_has_no_body() {
        let (_dir, statics) = site();
        let (_, text) = get(&statics, b"HEAD /hello.txt HTTP/1.1\r\n\r\n");

        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn directory_serves_its_index() {
        let (_dir, statics) = site();
        let (_, text) = get(&statics, b"GET /docs/ HTTP/1.1\r\n\r\n");

        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.ends_with("<p>docs</p>"));
    }

    #[test]
    fn directory_without_index() {
        let (_dir, statics) = site();
        let (_, text) = get(&statics, b"GET /empty HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn missing_file() {
        let (_dir, statics) = site();
        let (result, text) = get(&statics, b"GET /nope.txt HTTP/1.1\r\n\r\n");

        assert!(result.is_err());
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn post_is_not_allowed() {
        let (_dir, statics) = site();

        match get(&statics, b"POST /hello.txt HTTP/1.1\r\n\r\n") {
            (Err(Error::MethodNotAllowed), ref text) =>
                assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n")),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn symlink_out_of_the_root_is_forbidden() {
        let (dir, statics) = site();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        symlink(outside.path().join("secret.txt"),
                dir.path().join("leak.txt")).unwrap();

        let (_, text) = get(&statics, b"GET /leak.txt HTTP/1.1\r\n\r\n");

        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(!text.contains("secret"));
    }
}
