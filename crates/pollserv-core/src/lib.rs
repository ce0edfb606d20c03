//! # pollserv-core
//!
//! Core building blocks for the pollserv reactor.
//!
//! Nothing in this crate blocks or polls. The OS-facing pieces (sockets,
//! `poll(2)`, child processes) live in `pollserv-runtime`; the only system
//! surface used here is the `struct pollfd` layout and the `DescriptorIo`
//! trait that the runtime implements.
//!
//! ## Modules
//!
//! - `interest` - readiness/interest bits and descriptor categories
//! - `registry` - fixed-capacity descriptor registry with swap-remove
//! - `buffer` - per-descriptor output buffers with flush policies
//! - `session` - cookie sessions with inactivity expiry
//! - `traits` - the write capability the buffer store drives
//! - `error` - error types
//! - `kprint` - leveled stderr printing macros
//! - `env` - environment variable utilities

pub mod interest;
pub mod registry;
pub mod buffer;
pub mod session;
pub mod traits;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use interest::{Category, Interest};
pub use registry::{Descriptor, Registry};
pub use buffer::{BufferStore, FlushPolicy, PushStatus};
pub use session::{Session, SessionId, SessionStore};
pub use traits::DescriptorIo;
pub use error::{BufferError, RegistryError, ServerError, ServerResult, Severity};
pub use kprint::LogLevel;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_size, parse_size};

/// Tunable defaults shared by the runtime and the binary
pub mod constants {
    /// Default maximum number of simultaneous client connections
    pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

    /// Registry slots kept aside for log files on top of connections and listeners
    pub const RESERVED_LOG_SLOTS: usize = 2;

    /// Threshold-flush watermark (32 KB)
    pub const DEFAULT_FLUSH_THRESHOLD: usize = 32 * 1024;

    /// Absolute cap on a single buffered stream (32 MB)
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 32 * 1024 * 1024;

    /// Initial reservation for socket-oriented streams
    pub const SOCKET_BUFFER_RESERVE: usize = 4096;

    /// Default `poll(2)` timeout in milliseconds
    pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

    /// Default session inactivity timeout in seconds
    pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;

    /// Default interval between garbage collection passes in seconds
    pub const DEFAULT_GC_INTERVAL_SECS: u64 = 10;
}
