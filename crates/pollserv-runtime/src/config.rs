//! Server configuration

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pollserv_core::constants::{
    DEFAULT_FLUSH_THRESHOLD, DEFAULT_GC_INTERVAL_SECS, DEFAULT_MAX_BUFFER_SIZE,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_SESSION_TIMEOUT_SECS,
    RESERVED_LOG_SLOTS,
};
use pollserv_core::{env_get, env_get_bool, env_get_opt, env_get_size, LogLevel};

/// Where a log goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Off,
    File(PathBuf),
}

impl FromStr for LogTarget {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("empty log target"),
            "stderr" | "-" => Ok(LogTarget::Stderr),
            "off" | "none" => Ok(LogTarget::Off),
            path => Ok(LogTarget::File(PathBuf::from(path))),
        }
    }
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses to listen on (deduplicated, in order)
    pub listen: Vec<SocketAddrV4>,

    /// Maximum simultaneous client connections
    pub max_connections: usize,

    /// Listen backlog
    pub backlog: i32,

    /// Upper bound on one `poll(2)` wait (default: 100ms)
    pub poll_timeout: Duration,

    /// Watermark for log file buffers (default: 32 KB)
    pub flush_threshold: usize,

    /// Cap on any single output buffer (default: 32 MB)
    pub max_buffer_size: usize,

    /// Largest accepted request, head plus body (default: 1 MB)
    pub max_request_size: usize,

    /// Session inactivity timeout (default: 300s)
    pub session_timeout: Duration,

    /// Interval between session GC / child reaping passes (default: 10s)
    pub gc_interval: Duration,

    /// How long shutdown may spend draining buffers (default: 5s)
    pub drain_timeout: Duration,

    pub error_log: LogTarget,
    pub access_log: LogTarget,

    /// Minimum level written to the error log
    pub log_level: LogLevel,

    /// Copy file log lines to stderr as well
    pub echo_stderr: bool,

    /// Directory static files and CGI scripts are served from
    pub document_root: PathBuf,

    /// URI prefix routed to CGI (default: `/cgi-bin/`)
    pub cgi_prefix: String,

    /// URI prefix accepting POST/PUT uploads into the document root
    /// (default: `/uploads/`)
    pub upload_prefix: String,

    /// Script extension -> interpreter. Scripts without a match are executed
    /// directly.
    pub cgi_interpreters: BTreeMap<String, PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080)],
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backlog: 128,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_request_size: 1024 * 1024,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            drain_timeout: Duration::from_secs(5),
            error_log: LogTarget::Stderr,
            access_log: LogTarget::Stderr,
            log_level: LogLevel::Info,
            echo_stderr: false,
            document_root: PathBuf::from("./www"),
            cgi_prefix: String::from("/cgi-bin/"),
            upload_prefix: String::from("/uploads/"),
            cgi_interpreters: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `POLLSERV_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `POLLSERV_*` environment variables.
    ///
    /// Unset or unparsable variables leave the current value alone.
    pub fn with_env(mut self) -> Self {
        if let Ok(list) = std::env::var("POLLSERV_LISTEN") {
            let addrs: Vec<SocketAddrV4> = list
                .split(',')
                .filter_map(|a| parse_listen(a).ok())
                .collect();
            if !addrs.is_empty() {
                self.listen.clear();
                for addr in addrs {
                    self = self.listen(addr);
                }
            }
        }

        self.max_connections = env_get("POLLSERV_MAX_CONNECTIONS", self.max_connections);
        self.backlog = env_get("POLLSERV_BACKLOG", self.backlog);
        if let Some(ms) = env_get_opt::<u64>("POLLSERV_POLL_TIMEOUT_MS") {
            self.poll_timeout = Duration::from_millis(ms);
        }
        self.flush_threshold = env_get_size("POLLSERV_FLUSH_THRESHOLD", self.flush_threshold);
        self.max_buffer_size = env_get_size("POLLSERV_MAX_BUFFER_SIZE", self.max_buffer_size);
        self.max_request_size = env_get_size("POLLSERV_MAX_REQUEST_SIZE", self.max_request_size);
        if let Some(secs) = env_get_opt::<u64>("POLLSERV_SESSION_TIMEOUT_SECS") {
            self.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_get_opt::<u64>("POLLSERV_GC_INTERVAL_SECS") {
            self.gc_interval = Duration::from_secs(secs);
        }
        if let Some(target) = env_get_opt::<LogTarget>("POLLSERV_ERROR_LOG") {
            self.error_log = target;
        }
        if let Some(target) = env_get_opt::<LogTarget>("POLLSERV_ACCESS_LOG") {
            self.access_log = target;
        }
        if let Some(level) = env_get_opt::<LogLevel>("POLLSERV_LOG_LEVEL") {
            self.log_level = level;
        }
        self.echo_stderr = env_get_bool("POLLSERV_ECHO_STDERR", self.echo_stderr);
        if let Some(root) = env_get_opt::<PathBuf>("POLLSERV_DOCUMENT_ROOT") {
            self.document_root = root;
        }
        if let Some(prefix) = env_get_opt::<String>("POLLSERV_CGI_PREFIX") {
            self.cgi_prefix = prefix;
        }
        if let Some(prefix) = env_get_opt::<String>("POLLSERV_UPLOAD_PREFIX") {
            self.upload_prefix = prefix;
        }
        self
    }

    /// Add a listen address; duplicates are ignored
    pub fn listen(mut self, addr: SocketAddrV4) -> Self {
        if !self.listen.contains(&addr) {
            self.listen.push(addr);
        }
        self
    }

    /// Replace all listen addresses
    pub fn listen_only(mut self, addrs: impl IntoIterator<Item = SocketAddrV4>) -> Self {
        self.listen.clear();
        for addr in addrs {
            self = self.listen(addr);
        }
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    pub fn max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    pub fn session_timeout(mut self, d: Duration) -> Self {
        self.session_timeout = d;
        self
    }

    pub fn gc_interval(mut self, d: Duration) -> Self {
        self.gc_interval = d;
        self
    }

    pub fn drain_timeout(mut self, d: Duration) -> Self {
        self.drain_timeout = d;
        self
    }

    pub fn error_log(mut self, target: LogTarget) -> Self {
        self.error_log = target;
        self
    }

    pub fn access_log(mut self, target: LogTarget) -> Self {
        self.access_log = target;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn echo_stderr(mut self, enable: bool) -> Self {
        self.echo_stderr = enable;
        self
    }

    pub fn document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = root.into();
        self
    }

    pub fn cgi_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cgi_prefix = prefix.into();
        self
    }

    pub fn upload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.upload_prefix = prefix.into();
        self
    }

    /// Run scripts ending in `.{extension}` through `interpreter`
    pub fn cgi_interpreter(mut self, extension: &str, interpreter: impl Into<PathBuf>) -> Self {
        self.cgi_interpreters
            .insert(extension.trim_start_matches('.').to_string(), interpreter.into());
        self
    }

    /// Registry capacity: every client with its two CGI pipes, the
    /// listeners and the reserved log slots
    pub fn registry_capacity(&self) -> usize {
        self.max_connections * 3 + self.listen.len() + RESERVED_LOG_SLOTS
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.listen.is_empty() {
            return Err("at least one listen address is required");
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1");
        }
        if self.backlog <= 0 {
            return Err("backlog must be positive");
        }
        if self.poll_timeout.as_millis() > i32::MAX as u128 {
            return Err("poll_timeout too large");
        }
        if self.flush_threshold == 0 {
            return Err("flush_threshold must be at least 1");
        }
        if self.flush_threshold > self.max_buffer_size {
            return Err("flush_threshold exceeds max_buffer_size");
        }
        if self.max_request_size == 0 {
            return Err("max_request_size must be at least 1");
        }
        if self.max_request_size > self.max_buffer_size {
            return Err("max_request_size exceeds max_buffer_size");
        }
        if self.gc_interval.is_zero() {
            return Err("gc_interval must be non-zero");
        }
        if !self.cgi_prefix.starts_with('/') || !self.cgi_prefix.ends_with('/') {
            return Err("cgi_prefix must start and end with '/'");
        }
        if !self.upload_prefix.starts_with('/') || !self.upload_prefix.ends_with('/') {
            return Err("upload_prefix must start and end with '/'");
        }
        if self.upload_prefix.starts_with(&self.cgi_prefix) || self.cgi_prefix.starts_with(&self.upload_prefix) {
            return Err("upload_prefix and cgi_prefix overlap");
        }
        Ok(())
    }
}

/// Parse `port`, `ip:port` or `*:port`
pub fn parse_listen(text: &str) -> Result<SocketAddrV4, &'static str> {
    let text = text.trim();
    match text.rsplit_once(':') {
        None => text
            .parse::<u16>()
            .map(|port| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|_| "invalid port"),
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| "invalid port")?;
            let ip = match host {
                "" | "*" => Ipv4Addr::UNSPECIFIED,
                "localhost" => Ipv4Addr::LOCALHOST,
                other => other.parse().map_err(|_| "invalid IPv4 address")?,
            };
            Ok(SocketAddrV4::new(ip, port))
        }
    }
}
