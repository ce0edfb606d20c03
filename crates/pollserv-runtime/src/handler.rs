//! Request handling
//!
//! The reactor owns the descriptors; a [`RequestHandler`] owns the meaning of
//! a request. It is called with a [`HandlerContext`] (the connection
//! directory, the buffer store and the logger, all borrowed from the reactor)
//! and tells the reactor what to do next through an [`Outcome`].
//!
//! [`SiteHandler`] is the bundled handler: static files below a document
//! root, CGI scripts below one URL prefix and uploads below another.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Instant;

use pollserv_core::{BufferStore, Category, DescriptorIo, LogLevel, PushStatus, SessionId};

use crate::cgi::{kill_child, spawn_child_process, CgiProcess};
use crate::config::ServerConfig;
use crate::connection::{ConnectionDirectory, SESSION_COOKIE};
use crate::logger::{AccessRecord, Logger};
use crate::message::Response;

/// What the reactor does after [`RequestHandler::handle_request`]
#[derive(Debug)]
pub enum Outcome {
    /// A response is queued on the client; arm write
    Static,
    /// A CGI child was started; register its pipes
    CgiSpawned(CgiProcess),
    /// An error response is queued on the client; arm write
    ErrorBuffered,
    /// The request is incomplete; wait for more bytes
    Pending,
}

/// Reactor state lent to a handler for one call
pub struct HandlerContext<'a, I: DescriptorIo> {
    pub connections: &'a mut ConnectionDirectory,
    pub buffers: &'a mut BufferStore<I>,
    pub logger: &'a mut Logger,
}

impl<I: DescriptorIo> HandlerContext<'_, I> {
    /// Error log line
    pub fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.logger.log(self.buffers, level, args);
    }

    /// Install `response` on `client` and queue it
    pub fn respond(&mut self, client: RawFd, response: Response) -> bool {
        let Some(conn) = self.connections.get_mut(client) else {
            return false;
        };
        conn.response = response;
        self.finish(client)
    }

    /// Queue the response already installed on `client` and write its
    /// access record
    pub fn finish(&mut self, client: RawFd) -> bool {
        let Some((status, size)) = self.connections.finalize_and_close(client, self.buffers) else {
            return false;
        };
        if let Some(conn) = self.connections.get(client) {
            let request = &conn.request;
            let record = AccessRecord {
                client_ip: conn.peer_ip(),
                client_port: conn.peer_port(),
                method: request.method(),
                uri: request.uri(),
                version: request.version(),
                status,
                size,
                user_agent: request.header("User-Agent").unwrap_or(""),
                referrer: request.header("Referer").unwrap_or(""),
            };
            self.logger.access(self.buffers, &record);
        }
        true
    }
}

/// Application side of the reactor
pub trait RequestHandler {
    /// Bytes arrived on `client`. Called only while the request is being read.
    fn handle_request<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome;

    /// The CGI behind `pipe` finished writing. Queue the final response and
    /// return the client to arm.
    fn handle_pipe_read<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, pipe: RawFd) -> Option<RawFd> {
        let client = ctx.connections.client_for_pipe(pipe)?;
        let output = take_cgi_output(ctx.connections, client);
        let response = if output.is_empty() {
            ctx.log(LogLevel::Error, format_args!("CGI for client {} produced no output", client));
            Response::error(500)
        } else {
            Response::from_cgi(&output)
        };
        ctx.respond(client, response);
        Some(client)
    }

    /// The CGI behind `pipe` failed. Queue a 500 and return the client.
    fn handle_pipe_exception<I: DescriptorIo>(
        &mut self,
        ctx: &mut HandlerContext<'_, I>,
        pipe: RawFd,
    ) -> Option<RawFd> {
        let client = ctx.connections.client_for_pipe(pipe)?;
        ctx.log(LogLevel::Error, format_args!("CGI pipe {} failed for client {}", pipe, client));
        ctx.respond(client, Response::error(500));
        Some(client)
    }

    /// Queue an error page with `status` on `client`
    fn handle_error_response<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd, status: u16) {
        ctx.respond(client, Response::error(status));
    }
}

fn take_cgi_output(connections: &mut ConnectionDirectory, client: RawFd) -> Vec<u8> {
    connections
        .get_mut(client)
        .and_then(|conn| conn.cgi.as_mut())
        .map(|link| std::mem::take(&mut link.output))
        .unwrap_or_default()
}

/// Content type by file extension
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn has_parent_segment(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// Static files, CGI scripts and uploads
#[derive(Debug, Clone)]
pub struct SiteHandler {
    document_root: PathBuf,
    cgi_prefix: String,
    upload_prefix: String,
    interpreters: BTreeMap<String, PathBuf>,
    max_request_size: usize,
}

impl SiteHandler {
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self::from_config(&ServerConfig::new().document_root(document_root))
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            document_root: config.document_root.clone(),
            cgi_prefix: config.cgi_prefix.clone(),
            upload_prefix: config.upload_prefix.clone(),
            interpreters: config.cgi_interpreters.clone(),
            max_request_size: config.max_request_size,
        }
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    /// Directory CGI scripts are looked up in
    pub fn cgi_dir(&self) -> PathBuf {
        self.document_root.join(self.cgi_prefix.trim_matches('/'))
    }

    /// Put `response` on `client` with its session cookie and queue it
    fn respond_in_session<I: DescriptorIo>(&self, ctx: &mut HandlerContext<'_, I>, client: RawFd, response: Response) {
        let Some(conn) = ctx.connections.get_mut(client) else {
            return;
        };
        let presented = conn.request.cookie(SESSION_COOKIE).and_then(|v| v.parse::<SessionId>().ok());
        conn.response = response;
        ctx.connections.assign_session(client, presented, Instant::now());
        ctx.finish(client);
    }

    fn error<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd, status: u16) -> Outcome {
        self.handle_error_response(ctx, client, status);
        Outcome::ErrorBuffered
    }

    fn serve_static<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome {
        let Some(conn) = ctx.connections.get(client) else {
            return Outcome::Pending;
        };
        if conn.request.method() != "GET" {
            let allow = if conn.request.path().starts_with(&self.upload_prefix) {
                "GET, POST, PUT"
            } else {
                "GET"
            };
            let mut response = Response::error(405);
            response.set_header("Allow", allow);
            ctx.respond(client, response);
            return Outcome::ErrorBuffered;
        }
        let path = conn.request.path().to_owned();
        if has_parent_segment(&path) {
            return self.error(ctx, client, 403);
        }

        let mut file = self.document_root.join(path.trim_start_matches('/'));
        if file.is_dir() {
            file.push("index.html");
        }
        match std::fs::read(&file) {
            Ok(body) => {
                let response = Response::ok(guess_content_type(&file), body);
                self.respond_in_session(ctx, client, response);
                Outcome::Static
            }
            Err(e) => {
                let status = match e.kind() {
                    ErrorKind::NotFound => 404,
                    ErrorKind::PermissionDenied => 403,
                    _ => 500,
                };
                ctx.log(LogLevel::Debug, format_args!("{}: {}", file.display(), e));
                self.error(ctx, client, status)
            }
        }
    }

    /// Write the request body to the file named by the path. 201 when the
    /// file is new, 200 when it replaced an existing one.
    fn upload<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome {
        let Some(conn) = ctx.connections.get(client) else {
            return Outcome::Pending;
        };
        let path = conn.request.path().to_owned();
        let name = &path[self.upload_prefix.len()..];
        if has_parent_segment(&path) {
            return self.error(ctx, client, 403);
        }
        if name.is_empty() || name.ends_with('/') {
            return self.error(ctx, client, 405);
        }

        let file = self.document_root.join(path.trim_start_matches('/'));
        if file.is_dir() {
            return self.error(ctx, client, 405);
        }
        let existed = file.is_file();
        let body = conn.request.body();
        match std::fs::write(&file, body).map(|()| body.len()) {
            Ok(stored) => ctx.log(LogLevel::Debug, format_args!("stored {} bytes in {}", stored, file.display())),
            Err(e) => {
                let status = match e.kind() {
                    ErrorKind::NotFound => 404,
                    ErrorKind::PermissionDenied => 403,
                    _ => 500,
                };
                ctx.log(LogLevel::Error, format_args!("upload to {}: {}", file.display(), e));
                return self.error(ctx, client, status);
            }
        }

        let mut response = Response::new(if existed { 200 } else { 201 });
        response.set_header("Content-Type", "text/plain");
        if !existed {
            response.set_header("Location", &path);
        }
        response.set_body(if existed { b"updated\n".to_vec() } else { b"created\n".to_vec() });
        self.respond_in_session(ctx, client, response);
        Outcome::Static
    }

    fn spawn_cgi<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome {
        let Some(conn) = ctx.connections.get(client) else {
            return Outcome::Pending;
        };
        let request = &conn.request;
        let path = request.path();
        let rest = &path[self.cgi_prefix.len()..];
        let (script, path_info) = match rest.split_once('/') {
            Some((script, info)) => (script, format!("/{}", info)),
            None => (rest, String::new()),
        };
        if script.is_empty() {
            return self.error(ctx, client, 404);
        }
        if script == ".." || has_parent_segment(&path_info) {
            return self.error(ctx, client, 403);
        }

        let script_path = self.cgi_dir().join(script);
        if !script_path.is_file() {
            return self.error(ctx, client, 404);
        }

        let env = vec![
            ("GATEWAY_INTERFACE", "CGI/1.1".to_owned()),
            ("SERVER_SOFTWARE", "pollserv".to_owned()),
            ("SERVER_PROTOCOL", request.version().to_owned()),
            ("REQUEST_METHOD", request.method().to_owned()),
            ("REQUEST_URI", request.uri().to_owned()),
            ("QUERY_STRING", request.query().to_owned()),
            ("CONTENT_LENGTH", request.content_length().to_string()),
            ("CONTENT_TYPE", request.header("Content-Type").unwrap_or("").to_owned()),
            ("SCRIPT_FILENAME", script_path.to_string_lossy().into_owned()),
            ("SCRIPT_NAME", format!("{}{}", self.cgi_prefix, script)),
            ("PATH_INFO", path_info),
            ("REMOTE_ADDR", conn.peer_ip().to_string()),
            ("REMOTE_PORT", conn.peer_port().to_string()),
            ("PATH", "/usr/local/bin:/usr/bin:/bin".to_owned()),
        ];
        // Every other request header becomes HTTP_<NAME>.
        let http_headers: Vec<(String, String)> = request
            .headers()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("content-type") && !name.eq_ignore_ascii_case("content-length")
            })
            .map(|(name, value)| {
                (format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_")), value.to_owned())
            })
            .collect();
        let env = env.into_iter().map(|(k, v)| (k.to_owned(), v)).chain(http_headers);
        let body = request.body().to_vec();

        let interpreter = script_path
            .extension()
            .and_then(OsStr::to_str)
            .and_then(|ext| self.interpreters.get(ext));
        let (program, args): (&Path, Vec<&OsStr>) = match interpreter {
            Some(interpreter) => (interpreter.as_path(), vec![script_path.as_os_str()]),
            None => (script_path.as_path(), Vec::new()),
        };

        match spawn_child_process(program, &args, env, script_path.parent()) {
            Ok(child) => {
                ctx.log(
                    LogLevel::Debug,
                    format_args!("CGI {} started as pid {} for client {}", script_path.display(), child.pid, client),
                );
                let stdin = child.request_write.as_raw_fd();
                if ctx.buffers.push(stdin, Category::Pipe, &body) == PushStatus::Overflow {
                    ctx.log(
                        LogLevel::Warning,
                        format_args!("request body of {} bytes does not fit the pipe buffer", body.len()),
                    );
                    ctx.buffers.destroy(stdin);
                    if let Err(e) = kill_child(child.pid) {
                        ctx.log(LogLevel::Error, format_args!("{}", e));
                    }
                    drop(child);
                    return self.error(ctx, client, 413);
                }
                Outcome::CgiSpawned(child)
            }
            Err(e) => {
                ctx.log(LogLevel::Error, format_args!("{}: {}", script_path.display(), e));
                self.error(ctx, client, 500)
            }
        }
    }
}

impl RequestHandler for SiteHandler {
    fn handle_request<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome {
        let Some(conn) = ctx.connections.get_mut(client) else {
            return Outcome::Pending;
        };
        match conn.request.poll_complete(self.max_request_size) {
            Ok(false) => return Outcome::Pending,
            Ok(true) => {}
            Err(status) => return self.error(ctx, client, status),
        }

        let path = conn.request.path();
        let method = conn.request.method();
        if path.starts_with(&self.cgi_prefix) {
            self.spawn_cgi(ctx, client)
        } else if path.starts_with(&self.upload_prefix) && (method == "POST" || method == "PUT") {
            self.upload(ctx, client)
        } else {
            self.serve_static(ctx, client)
        }
    }

    fn handle_pipe_read<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, pipe: RawFd) -> Option<RawFd> {
        let client = ctx.connections.client_for_pipe(pipe)?;
        let output = take_cgi_output(ctx.connections, client);
        if output.is_empty() {
            ctx.log(LogLevel::Error, format_args!("CGI for client {} produced no output", client));
            self.handle_error_response(ctx, client, 500);
        } else {
            self.respond_in_session(ctx, client, Response::from_cgi(&output));
        }
        Some(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Accepted;
    use crate::sys::SysIo;
    use pollserv_core::Registry;
    use std::net::Ipv4Addr;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct Fixture {
        registry: Registry,
        connections: ConnectionDirectory,
        buffers: BufferStore<SysIo>,
        logger: Logger,
        _peer: UnixStream,
        client: RawFd,
    }

    impl Fixture {
        fn new(raw_request: &[u8]) -> Self {
            Self::with_buffer_cap(raw_request, 1 << 20)
        }

        fn with_buffer_cap(raw_request: &[u8], max_buffer_size: usize) -> Self {
            let (ours, peer) = UnixStream::pair().unwrap();
            let mut registry = Registry::with_capacity(8);
            let mut connections = ConnectionDirectory::new(Duration::from_secs(60), Duration::from_secs(10));
            let client = connections
                .accept(
                    &mut registry,
                    Accepted { fd: OwnedFd::from(ours), ip: Ipv4Addr::LOCALHOST, port: 4000 },
                )
                .unwrap();
            connections.get_mut(client).unwrap().request.append(raw_request);
            Self {
                registry,
                connections,
                buffers: BufferStore::new(SysIo, 1024, max_buffer_size),
                logger: Logger::disabled(),
                _peer: peer,
                client,
            }
        }

        fn ctx(&mut self) -> HandlerContext<'_, SysIo> {
            HandlerContext {
                connections: &mut self.connections,
                buffers: &mut self.buffers,
                logger: &mut self.logger,
            }
        }

        fn queued(&self) -> String {
            String::from_utf8_lossy(self.buffers.peek(self.client)).into_owned()
        }
    }

    fn site(name: &str) -> (SiteHandler, PathBuf) {
        let root = std::env::temp_dir().join(format!("pollserv-site-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("hello.txt"), b"hello").unwrap();
        std::fs::write(root.join("docs/index.html"), b"<p>docs</p>").unwrap();
        (SiteHandler::new(&root), root)
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("a/index.HTML")), "text/html");
        assert_eq!(guess_content_type(Path::new("x.css")), "text/css");
        assert_eq!(guess_content_type(Path::new("x.jpeg")), "image/jpeg");
        assert_eq!(guess_content_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_incomplete_request_is_pending() {
        let (mut site, root) = site("pending");
        let mut fx = Fixture::new(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::Pending));
        assert!(fx.buffers.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_static_file_sets_session_cookie() {
        let (mut site, root) = site("static");
        let mut fx = Fixture::new(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::Static));

        let text = fx.queued();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Set-Cookie: session="));
        assert!(text.ends_with("\r\n\r\nhello"));
        assert_eq!(fx.connections.sessions().len(), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_known_session_is_reused() {
        let (mut site, root) = site("session");
        let mut fx = Fixture::new(b"GET /hello.txt HTTP/1.1\r\n\r\n");
        let first = fx.client;
        site.handle_request(&mut fx.ctx(), first);
        let id = fx.connections.get(first).unwrap().session.unwrap();

        let (ours, _peer) = UnixStream::pair().unwrap();
        let second = fx
            .connections
            .accept(
                &mut fx.registry,
                Accepted { fd: OwnedFd::from(ours), ip: Ipv4Addr::LOCALHOST, port: 4001 },
            )
            .unwrap();
        let request = format!("GET /hello.txt HTTP/1.1\r\nCookie: session={}\r\n\r\n", id);
        fx.connections.get_mut(second).unwrap().request.append(request.as_bytes());
        assert!(matches!(site.handle_request(&mut fx.ctx(), second), Outcome::Static));

        assert_eq!(fx.connections.get(second).unwrap().session, Some(id));
        let text = String::from_utf8_lossy(fx.buffers.peek(second)).into_owned();
        assert!(!text.contains("Set-Cookie"));
        assert_eq!(fx.connections.sessions().len(), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_directory_serves_index() {
        let (mut site, root) = site("index");
        let mut fx = Fixture::new(b"GET /docs/ HTTP/1.1\r\n\r\n");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::Static));
        let text = fx.queued();
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.ends_with("<p>docs</p>"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_static_errors() {
        let (mut site, root) = site("errors");
        for (raw, status) in [
            (&b"GET /missing.txt HTTP/1.1\r\n\r\n"[..], "404"),
            (&b"GET /../etc/passwd HTTP/1.1\r\n\r\n"[..], "403"),
            (&b"DELETE /hello.txt HTTP/1.1\r\n\r\n"[..], "405"),
            (&b"GET / HTTP/2.0\r\n\r\n"[..], "505"),
        ] {
            let mut fx = Fixture::new(raw);
            let client = fx.client;
            assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::ErrorBuffered));
            assert!(fx.queued().starts_with(&format!("HTTP/1.1 {} ", status)), "{:?}", fx.queued());
        }
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_upload_creates_then_replaces() {
        let (mut site, root) = site("upload");
        std::fs::create_dir_all(root.join("uploads")).unwrap();

        let mut fx = Fixture::new(b"POST /uploads/note.txt HTTP/1.1\r\nContent-Length: 5\r\n\r\nfirst");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::Static));
        let text = fx.queued();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Location: /uploads/note.txt\r\n"));
        assert_eq!(std::fs::read(root.join("uploads/note.txt")).unwrap(), b"first");

        let mut fx = Fixture::new(b"PUT /uploads/note.txt HTTP/1.1\r\nContent-Length: 6\r\n\r\nsecond");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::Static));
        let text = fx.queued();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!text.contains("Location:"));
        assert_eq!(std::fs::read(root.join("uploads/note.txt")).unwrap(), b"second");

        // Uploaded files are served like any other.
        let mut fx = Fixture::new(b"GET /uploads/note.txt HTTP/1.1\r\n\r\n");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::Static));
        assert!(fx.queued().ends_with("second"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_upload_refusals() {
        let (mut site, root) = site("uploadbad");
        std::fs::create_dir_all(root.join("uploads/dir")).unwrap();
        for (raw, status) in [
            (&b"POST /uploads/../hello.txt HTTP/1.1\r\nContent-Length: 1\r\n\r\nx"[..], "403"),
            (&b"POST /uploads/ HTTP/1.1\r\nContent-Length: 1\r\n\r\nx"[..], "405"),
            (&b"PUT /uploads/dir HTTP/1.1\r\nContent-Length: 1\r\n\r\nx"[..], "405"),
            (&b"POST /uploads/no/such/file HTTP/1.1\r\nContent-Length: 1\r\n\r\nx"[..], "404"),
            (&b"POST /hello.txt HTTP/1.1\r\nContent-Length: 1\r\n\r\nx"[..], "405"),
        ] {
            let mut fx = Fixture::new(raw);
            let client = fx.client;
            assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::ErrorBuffered));
            assert!(fx.queued().starts_with(&format!("HTTP/1.1 {} ", status)), "{:?}", fx.queued());
        }
        assert_eq!(std::fs::read(root.join("hello.txt")).unwrap(), b"hello");

        let mut fx = Fixture::new(b"DELETE /uploads/x HTTP/1.1\r\n\r\n");
        let client = fx.client;
        site.handle_request(&mut fx.ctx(), client);
        assert!(fx.queued().contains("Allow: GET, POST, PUT\r\n"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_missing_cgi_script_is_404() {
        let (mut site, root) = site("nocgi");
        let mut fx = Fixture::new(b"GET /cgi-bin/none.sh HTTP/1.1\r\n\r\n");
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::ErrorBuffered));
        assert!(fx.queued().starts_with("HTTP/1.1 404 "));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_cgi_spawn_queues_body_on_stdin() {
        let (_, root) = site("cgi");
        std::fs::create_dir_all(root.join("cgi-bin")).unwrap();
        std::fs::write(root.join("cgi-bin/echo.sh"), b"cat\n").unwrap();
        let config = ServerConfig::new()
            .document_root(&root)
            .cgi_interpreter("sh", "/bin/sh");
        let mut site = SiteHandler::from_config(&config);

        let mut fx = Fixture::new(b"POST /cgi-bin/echo.sh/extra?x=1 HTTP/1.1\r\nContent-Length: 4\r\n\r\nping");
        let client = fx.client;
        let Outcome::CgiSpawned(child) = site.handle_request(&mut fx.ctx(), client) else {
            panic!("expected a CGI child");
        };
        assert!(child.pid > 0);
        assert_eq!(fx.buffers.peek(child.request_write.as_raw_fd()), b"ping");
        assert!(fx.buffers.peek(client).is_empty());
        drop(child);
        crate::cgi::reap_children();
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_cgi_body_over_buffer_cap_is_413() {
        let (_, root) = site("cgibig");
        std::fs::create_dir_all(root.join("cgi-bin")).unwrap();
        std::fs::write(root.join("cgi-bin/echo.sh"), b"cat\n").unwrap();
        let config = ServerConfig::new()
            .document_root(&root)
            .cgi_interpreter("sh", "/bin/sh");
        let mut site = SiteHandler::from_config(&config);

        let mut raw = b"POST /cgi-bin/echo.sh HTTP/1.1\r\nContent-Length: 4000\r\n\r\n".to_vec();
        raw.extend_from_slice(&[b'x'; 4000]);
        let mut fx = Fixture::with_buffer_cap(&raw, 1024);
        let client = fx.client;
        assert!(matches!(site.handle_request(&mut fx.ctx(), client), Outcome::ErrorBuffered));
        assert!(fx.queued().starts_with("HTTP/1.1 413 "));
        assert_eq!(fx.buffers.len(), 1);
        crate::cgi::reap_children();
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_pipe_read_finalizes_cgi_output() {
        let (mut site, root) = site("piperead");
        let mut fx = Fixture::new(b"GET /cgi-bin/x HTTP/1.1\r\n\r\n");
        let client = fx.client;
        fx.connections.bind_cgi(client, 1, 90, 91);
        fx.connections.get_mut(client).unwrap().cgi.as_mut().unwrap().output =
            b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\nmade".to_vec();

        assert_eq!(site.handle_pipe_read(&mut fx.ctx(), 90), Some(client));
        let text = fx.queued();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Set-Cookie: session="));
        assert!(text.ends_with("made"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_empty_cgi_output_is_500() {
        let (mut site, root) = site("empty");
        let mut fx = Fixture::new(b"GET /cgi-bin/x HTTP/1.1\r\n\r\n");
        let client = fx.client;
        fx.connections.bind_cgi(client, 1, 90, 91);
        assert_eq!(site.handle_pipe_read(&mut fx.ctx(), 90), Some(client));
        assert!(fx.queued().starts_with("HTTP/1.1 500 "));
        assert_eq!(site.handle_pipe_read(&mut fx.ctx(), 77), None);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_pipe_exception_is_500() {
        let (mut site, root) = site("exception");
        let mut fx = Fixture::new(b"GET /cgi-bin/x HTTP/1.1\r\n\r\n");
        let client = fx.client;
        fx.connections.bind_cgi(client, 1, 90, 91);
        assert_eq!(site.handle_pipe_exception(&mut fx.ctx(), 91), Some(client));
        assert!(fx.queued().starts_with("HTTP/1.1 500 "));
        let _ = std::fs::remove_dir_all(root);
    }
}
