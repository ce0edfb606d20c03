//! Error and access logging
//!
//! Two independent destinations. A stderr destination prints immediately
//! through `kprint`; a file destination is opened once at startup and its
//! lines go through the buffer store with the threshold policy, so the
//! reactor writes them out in batches when the file is writable.
//!
//! When a push crosses the watermark the file's fd is queued as a flush
//! request. The reactor drains the queue each tick and registers the file
//! for write interest.

use std::fmt;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::SystemTime;

use pollserv_core::kprint::{self, format_line, timestamp};
use pollserv_core::{BufferStore, Category, DescriptorIo, LogLevel, PushStatus, ServerError, ServerResult};

use crate::config::{LogTarget, ServerConfig};

/// Where one log goes
#[derive(Debug)]
pub enum Destination {
    Off,
    Stderr,
    File(OwnedFd),
}

impl Destination {
    /// Open a target. File targets are created if missing and appended to.
    pub fn open(target: &LogTarget) -> ServerResult<Self> {
        match target {
            LogTarget::Off => Ok(Destination::Off),
            LogTarget::Stderr => Ok(Destination::Stderr),
            LogTarget::File(path) => open_log_file(path).map(Destination::File),
        }
    }

    fn file_fd(&self) -> Option<RawFd> {
        match self {
            Destination::File(fd) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }
}

fn open_log_file(path: &Path) -> ServerResult<OwnedFd> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map(OwnedFd::from)
        .map_err(|e| ServerError::LogFileOpen(e.raw_os_error().unwrap_or(libc::EIO)))
}

/// One served response, as recorded in the access log
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub method: &'a str,
    pub uri: &'a str,
    pub version: &'a str,
    pub status: u16,
    pub size: usize,
    pub user_agent: &'a str,
    pub referrer: &'a str,
}

impl AccessRecord<'_> {
    /// `key="value"` line, newline included
    pub fn format(&self, at: SystemTime) -> String {
        format!(
            "timestamp=\"{}\" clientIP=\"{}\" clientPort=\"{}\" method=\"{}\" requestUri=\"{}\" \
             httpVersion=\"{}\" statusCode=\"{}\" responseSize=\"{}\" userAgent=\"{}\" referrer=\"{}\"\n",
            timestamp(at),
            self.client_ip,
            self.client_port,
            escape(self.method),
            escape(self.uri),
            escape(self.version),
            self.status,
            self.size,
            escape(self.user_agent),
            escape(self.referrer),
        )
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// The server's two logs
#[derive(Debug)]
pub struct Logger {
    error: Destination,
    access: Destination,
    level: LogLevel,
    echo_stderr: bool,
    flush_requests: Vec<RawFd>,
}

impl Logger {
    pub fn new(error: Destination, access: Destination, level: LogLevel) -> Self {
        Self {
            error,
            access,
            level,
            echo_stderr: false,
            flush_requests: Vec::new(),
        }
    }

    /// Open both destinations named in the config.
    ///
    /// A log file that cannot be opened is fatal.
    pub fn open(config: &ServerConfig) -> ServerResult<Self> {
        let error = Destination::open(&config.error_log)?;
        let access = Destination::open(&config.access_log)?;
        let mut logger = Self::new(error, access, config.log_level);
        logger.echo_stderr = config.echo_stderr;
        Ok(logger)
    }

    /// Both logs on stderr
    pub fn stderr(level: LogLevel) -> Self {
        Self::new(Destination::Stderr, Destination::Stderr, level)
    }

    /// Both logs off
    pub fn disabled() -> Self {
        Self::new(Destination::Off, Destination::Off, LogLevel::Critical)
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level && !matches!(self.error, Destination::Off)
    }

    /// Error log line at `level`
    pub fn log<I: DescriptorIo>(&mut self, buffers: &mut BufferStore<I>, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let line = format_line(SystemTime::now(), level, args);
        self.emit(buffers, Which::Error, &line);
    }

    /// Access log record
    pub fn access<I: DescriptorIo>(&mut self, buffers: &mut BufferStore<I>, record: &AccessRecord<'_>) {
        if matches!(self.access, Destination::Off) {
            return;
        }
        let line = record.format(SystemTime::now());
        self.emit(buffers, Which::Access, &line);
    }

    fn emit<I: DescriptorIo>(&mut self, buffers: &mut BufferStore<I>, which: Which, line: &str) {
        let destination = match which {
            Which::Error => &self.error,
            Which::Access => &self.access,
        };
        let fd = match destination {
            Destination::Off => return,
            Destination::Stderr => {
                kprint::_kwrite_impl(line.as_bytes());
                return;
            }
            Destination::File(fd) => fd.as_raw_fd(),
        };

        if self.echo_stderr {
            kprint::_kwrite_impl(line.as_bytes());
        }
        match buffers.push(fd, Category::RegularFile, line.as_bytes()) {
            PushStatus::Buffered => {}
            PushStatus::FlushRequested => {
                if !self.flush_requests.contains(&fd) {
                    self.flush_requests.push(fd);
                }
            }
            PushStatus::Overflow => {
                kprint::_kwrite_impl(line.as_bytes());
            }
        }
    }

    /// Log files waiting to be flushed. Drains the queue.
    pub fn take_flush_requests(&mut self) -> Vec<RawFd> {
        std::mem::take(&mut self.flush_requests)
    }

    /// Queue every log file with pending bytes for flushing
    pub fn request_flush_all<I: DescriptorIo>(&mut self, buffers: &BufferStore<I>) {
        for fd in self.file_fds() {
            if buffers.remaining(fd) > 0 && !self.flush_requests.contains(&fd) {
                self.flush_requests.push(fd);
            }
        }
    }

    /// Descriptors of open log files
    pub fn file_fds(&self) -> Vec<RawFd> {
        self.error.file_fd().into_iter().chain(self.access.file_fd()).collect()
    }

    /// Turn off the destination writing to `fd` and close it.
    ///
    /// Used after a write error on a log file; later lines are dropped.
    pub fn disable(&mut self, fd: RawFd) -> bool {
        self.flush_requests.retain(|&queued| queued != fd);
        let mut hit = false;
        for destination in [&mut self.error, &mut self.access] {
            if destination.file_fd() == Some(fd) {
                *destination = Destination::Off;
                hit = true;
            }
        }
        hit
    }
}

#[derive(Clone, Copy)]
enum Which {
    Error,
    Access,
}
