//! Leveled stderr printing for pollserv
//!
//! Lines are written whole under the stderr lock, each prefixed with a local
//! timestamp and a level tag, the same format the reactor's error log uses:
//!
//! ```text
//! 2024-05-01 12:00:00 [INFO] listening on 0.0.0.0:8080
//! ```
//!
//! # Environment Variables
//!
//! - `POLLSERV_LOG_LEVEL=<level>` - minimum level printed: verbose, debug,
//!   info, warning, error, critical or off (default: info)
//! - `POLLSERV_FLUSH_EPRINT=1` - flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! use pollserv_core::{kinfo, kerror};
//!
//! kinfo!("listening on {}", addr);
//! kerror!("poll failed: {}", err);
//! ```

use core::fmt;
use core::str::FromStr;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity of a log line, least to most severe
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Verbose = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
}

/// Threshold value meaning "print nothing"
const LEVEL_OFF: u8 = u8::MAX;

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Verbose,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            _ => LogLevel::Critical,
        }
    }

    /// Upper-case tag used inside the brackets
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verbose" | "trace" => Ok(LogLevel::Verbose),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => Err(()),
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables.
///
/// Called on first use; call explicitly for deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("POLLSERV_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("POLLSERV_LOG_LEVEL") {
        if val.eq_ignore_ascii_case("off") {
            LOG_LEVEL.store(LEVEL_OFF, Ordering::Relaxed);
        } else if let Ok(level) = val.parse::<LogLevel>() {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
    }
}

#[inline]
fn ensure_init() {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    ensure_init();
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Current minimum level, `None` when printing is off
#[inline]
pub fn log_level() -> Option<LogLevel> {
    ensure_init();
    match LOG_LEVEL.load(Ordering::Relaxed) {
        LEVEL_OFF => None,
        v => Some(LogLevel::from_u8(v)),
    }
}

/// Set the minimum level; `None` turns printing off
pub fn set_log_level(level: Option<LogLevel>) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level.map_or(LEVEL_OFF, |l| l as u8), Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    log_level().is_some_and(|min| level >= min)
}

/// Local time as `YYYY-MM-DD HH:MM:SS`
pub fn timestamp(at: SystemTime) -> String {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as libc::time_t)
        .unwrap_or(0);

    // Safety: localtime_r and strftime only touch the buffers passed in.
    unsafe {
        let mut tm: libc::tm = core::mem::zeroed();
        if libc::localtime_r(&secs, &mut tm).is_null() {
            return String::from("0000-00-00 00:00:00");
        }
        let mut buf = [0u8; 32];
        let n = libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            b"%Y-%m-%d %H:%M:%S\0".as_ptr() as *const libc::c_char,
            &tm,
        );
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }
}

/// Render one log line, newline included
pub fn format_line(at: SystemTime, level: LogLevel, args: fmt::Arguments<'_>) -> String {
    format!("{} [{}] {}\n", timestamp(at), level.tag(), args)
}

#[doc(hidden)]
pub fn _kprintln_impl(args: fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Write a preformatted line to stderr regardless of level
#[doc(hidden)]
pub fn _kwrite_impl(line: &[u8]) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(line);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    _kwrite_impl(format_line(SystemTime::now(), level, args).as_bytes());
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print a line to stderr, no prefix
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kcritical {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Critical,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warning,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

// ============================================================================
// Tests
// ============================================================================
