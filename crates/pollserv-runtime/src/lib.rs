//! # pollserv-runtime
//!
//! OS-facing half of pollserv: the single-threaded `poll(2)` reactor and
//! everything it drives.
//!
//! This crate provides:
//! - Server configuration with `POLLSERV_*` environment overlay
//! - `libc`-backed descriptor I/O for the buffer store
//! - Non-blocking listener sockets and accept
//! - CGI child spawning over pipes, and zombie reaping
//! - Shutdown signal handling
//! - Minimal HTTP/1.1 request/response messages
//! - The request handler trait and the bundled static/CGI site handler
//! - The connection directory (connections, pipe routes, sessions)
//! - Error and access logging through the buffer store
//! - The reactor itself

pub mod config;
pub mod sys;
pub mod net;
pub mod cgi;
pub mod signal;
pub mod message;
pub mod handler;
pub mod connection;
pub mod logger;
pub mod reactor;

// Re-exports
pub use config::{LogTarget, ServerConfig};
pub use sys::SysIo;
pub use net::{Accepted, Listener};
pub use cgi::{kill_child, reap_children, spawn_child_process, CgiProcess};
pub use message::{Request, Response};
pub use handler::{guess_content_type, HandlerContext, Outcome, RequestHandler, SiteHandler};
pub use connection::{CgiLink, Connection, ConnectionDirectory, Phase};
pub use logger::{AccessRecord, Destination, Logger};
pub use reactor::{Reactor, ReactorStats};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Platform name reported at startup
        pub const PLATFORM: &str = if cfg!(target_os = "linux") { "linux" } else { "unix" };
    } else {
        compile_error!("pollserv requires a Unix platform");
    }
}
