//! pollserv HTTP server
//!
//! Single-threaded HTTP/1.1 server on a `poll(2)` reactor. Serves static
//! files from a document root, runs CGI scripts below `/cgi-bin/` and
//! accepts uploads below `/uploads/`.
//!
//! Every option can also be set through a `POLLSERV_*` environment
//! variable; command-line flags win.
//!
//! Usage:
//!     ./target/release/pollserv [--listen 8080]... [--root ./www]
//!         [--cgi-interpreter py=/usr/bin/python3] [--access-log access.log]
//!
//! Benchmark:
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use pollserv_core::{kcritical, kprint, parse_size, LogLevel, ServerResult};
use pollserv_runtime::config::parse_listen;
use pollserv_runtime::{signal, LogTarget, Logger, Reactor, ServerConfig, SiteHandler};

#[derive(Debug, Parser)]
#[command(name = "pollserv", version, about = "Single-threaded poll(2) HTTP server with CGI")]
struct Cli {
    /// Address to listen on: `port`, `ip:port` or `*:port` (repeatable)
    #[arg(short, long = "listen", value_parser = parse_listen)]
    listen: Vec<SocketAddrV4>,

    /// Maximum simultaneous clients
    #[arg(long)]
    max_connections: Option<usize>,

    /// Document root for static files and CGI scripts
    #[arg(short = 'r', long = "root")]
    document_root: Option<PathBuf>,

    /// URL prefix routed to CGI scripts
    #[arg(long)]
    cgi_prefix: Option<String>,

    /// URL prefix accepting POST/PUT uploads
    #[arg(long)]
    upload_prefix: Option<String>,

    /// Interpreter for a script extension, as `ext=/path/to/interpreter`
    /// (repeatable)
    #[arg(long = "cgi-interpreter", value_parser = parse_interpreter)]
    cgi_interpreters: Vec<(String, PathBuf)>,

    /// Error log: `stderr`, `off` or a file path
    #[arg(long)]
    error_log: Option<LogTarget>,

    /// Access log: `stderr`, `off` or a file path
    #[arg(long)]
    access_log: Option<LogTarget>,

    /// Lowest error log level written
    #[arg(long, value_parser = parse_level)]
    log_level: Option<LogLevel>,

    /// Copy file-bound log lines to stderr
    #[arg(long)]
    echo_stderr: bool,

    /// poll() timeout in milliseconds
    #[arg(long)]
    poll_timeout_ms: Option<u64>,

    /// Log flush watermark, e.g. `32k`
    #[arg(long, value_parser = parse_bytes)]
    flush_threshold: Option<usize>,

    /// Cap on any single output buffer, e.g. `32m`
    #[arg(long, value_parser = parse_bytes)]
    max_buffer_size: Option<usize>,

    /// Largest accepted request, head and body, e.g. `1m`
    #[arg(long, value_parser = parse_bytes)]
    max_request_size: Option<usize>,

    /// Session inactivity timeout in seconds
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Seconds between session GC passes
    #[arg(long)]
    gc_interval: Option<u64>,
}

fn parse_interpreter(text: &str) -> Result<(String, PathBuf), String> {
    match text.split_once('=') {
        Some((ext, path)) if !ext.is_empty() && !path.is_empty() => Ok((ext.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected ext=/path/to/interpreter, got '{}'", text)),
    }
}

fn parse_level(text: &str) -> Result<LogLevel, String> {
    text.parse()
        .map_err(|()| format!("unknown log level '{}'", text))
}

fn parse_bytes(text: &str) -> Result<usize, String> {
    parse_size(text).ok_or_else(|| format!("invalid size '{}'", text))
}

impl Cli {
    /// Overlay the flags that were given on `config`
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if !self.listen.is_empty() {
            config = config.listen_only(self.listen);
        }
        if let Some(n) = self.max_connections {
            config = config.max_connections(n);
        }
        if let Some(root) = self.document_root {
            config = config.document_root(root);
        }
        if let Some(prefix) = self.cgi_prefix {
            config = config.cgi_prefix(prefix);
        }
        if let Some(prefix) = self.upload_prefix {
            config = config.upload_prefix(prefix);
        }
        for (ext, interpreter) in self.cgi_interpreters {
            config = config.cgi_interpreter(&ext, interpreter);
        }
        if let Some(target) = self.error_log {
            config = config.error_log(target);
        }
        if let Some(target) = self.access_log {
            config = config.access_log(target);
        }
        if let Some(level) = self.log_level {
            config = config.log_level(level);
        }
        if self.echo_stderr {
            config = config.echo_stderr(true);
        }
        if let Some(ms) = self.poll_timeout_ms {
            config = config.poll_timeout(Duration::from_millis(ms));
        }
        if let Some(bytes) = self.flush_threshold {
            config = config.flush_threshold(bytes);
        }
        if let Some(bytes) = self.max_buffer_size {
            config = config.max_buffer_size(bytes);
        }
        if let Some(bytes) = self.max_request_size {
            config = config.max_request_size(bytes);
        }
        if let Some(secs) = self.session_timeout {
            config = config.session_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.gc_interval {
            config = config.gc_interval(Duration::from_secs(secs));
        }
        config
    }
}

fn serve(config: ServerConfig) -> ServerResult<()> {
    signal::install_handlers()?;
    let logger = Logger::open(&config)?;
    let handler = SiteHandler::from_config(&config);
    let mut reactor = Reactor::new(config, logger, handler)?;
    reactor.listen_all()?;
    reactor.run()
}

fn main() -> ExitCode {
    kprint::init();
    let config = Cli::parse().apply(ServerConfig::from_env());
    kprint::set_log_level(Some(config.log_level));

    match serve(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            kcritical!("pollserv: {}", e);
            ExitCode::FAILURE
        }
    }
}
