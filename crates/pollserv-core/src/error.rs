//! Error types for the pollserv reactor
//!
//! Errors carry the raw `errno` where one exists. Each `ServerError` has a
//! [`Severity`]: fatal errors end the reactor loop (after buffers are
//! drained), recoverable ones only cost the affected descriptor.

use core::fmt;
use std::io;
use std::os::fd::RawFd;

/// Result type for reactor operations
pub type ServerResult<T> = Result<T, ServerError>;

/// How an error is handled by the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log and clean up the affected descriptor, keep running
    Recoverable,
    /// Drain all buffers and terminate
    Fatal,
}

/// Errors raised by the descriptor registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registry is at its fixed capacity
    CapacityExceeded,
    /// Descriptor is already watched
    AlreadyRegistered(RawFd),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded => write!(f, "descriptor registry at capacity"),
            RegistryError::AlreadyRegistered(fd) => write!(f, "descriptor {} already registered", fd),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors raised by the buffer store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Write failed with errno (never EAGAIN/EWOULDBLOCK/EINTR)
    Io { fd: RawFd, errno: i32 },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Io { fd, errno } => write!(
                f,
                "write on descriptor {} failed: {}",
                fd,
                io::Error::from_raw_os_error(*errno)
            ),
        }
    }
}

impl std::error::Error for BufferError {}

/// Errors surfaced by the reactor and its collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// socket() failed
    SocketCreate(i32),
    /// bind() failed
    SocketBind(i32),
    /// listen() failed
    SocketListen(i32),
    /// fcntl()/setsockopt() on a socket failed
    SocketSet(i32),
    /// POLLERR on a listening socket
    ServerSocket(RawFd),
    /// POLLHUP on a listening socket
    ServerSocketClosed(RawFd),
    /// POLLNVAL on a listening socket
    ServerSocketInvalid(RawFd),
    /// poll() failed
    Poll(i32),
    /// Log file could not be opened
    LogFileOpen(i32),
    /// Invalid configuration
    Config(&'static str),
    /// sigaction() failed
    SignalInstall(i32),

    /// No registry slot left for a new client
    MaximumConnectionsReached,
    /// accept() failed
    ConnectionEstablishing(i32),
    /// read() on a descriptor failed
    Read { fd: RawFd, errno: i32 },
    /// Spawning a CGI child failed
    CgiSpawn(i32),
    /// kill() on a CGI child failed
    CgiKill { pid: u32, errno: i32 },
    /// Registry operation failed
    Registry(RegistryError),
    /// Buffer operation failed
    Buffer(BufferError),
}

impl ServerError {
    /// Severity class of this error
    pub fn severity(&self) -> Severity {
        match self {
            ServerError::SocketCreate(_)
            | ServerError::SocketBind(_)
            | ServerError::SocketListen(_)
            | ServerError::SocketSet(_)
            | ServerError::ServerSocket(_)
            | ServerError::ServerSocketClosed(_)
            | ServerError::ServerSocketInvalid(_)
            | ServerError::Poll(_)
            | ServerError::LogFileOpen(_)
            | ServerError::Config(_)
            | ServerError::SignalInstall(_) => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    /// Whether the reactor must stop
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Build from the calling thread's last OS error
    pub fn last_os(make: fn(i32) -> ServerError) -> ServerError {
        make(last_errno())
    }
}

/// errno of the last failed libc call on this thread
#[inline]
pub fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn os(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::SocketCreate(e) => write!(f, "failed to create socket: {}", os(e)),
            ServerError::SocketBind(e) => write!(f, "failed to bind socket: {}", os(e)),
            ServerError::SocketListen(e) => write!(f, "failed to listen on socket: {}", os(e)),
            ServerError::SocketSet(e) => write!(f, "failed to set socket options: {}", os(e)),
            ServerError::ServerSocket(fd) => write!(f, "error on server socket {}", fd),
            ServerError::ServerSocketClosed(fd) => write!(f, "server socket {} closed", fd),
            ServerError::ServerSocketInvalid(fd) => write!(f, "server socket {} invalid", fd),
            ServerError::Poll(e) => write!(f, "poll failed: {}", os(e)),
            ServerError::LogFileOpen(e) => write!(f, "failed to open log file: {}", os(e)),
            ServerError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            ServerError::SignalInstall(e) => {
                write!(f, "failed to install signal handlers: {}", os(e))
            }
            ServerError::MaximumConnectionsReached => write!(f, "maximum connections reached"),
            ServerError::ConnectionEstablishing(e) => {
                write!(f, "failed to establish connection: {}", os(e))
            }
            ServerError::Read { fd, errno } => {
                write!(f, "read on descriptor {} failed: {}", fd, os(errno))
            }
            ServerError::CgiSpawn(e) => write!(f, "failed to spawn CGI process: {}", os(e)),
            ServerError::CgiKill { pid, errno } => {
                write!(f, "failed to kill CGI process {}: {}", pid, os(errno))
            }
            ServerError::Registry(e) => write!(f, "registry: {}", e),
            ServerError::Buffer(e) => write!(f, "buffer: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Registry(e) => Some(e),
            ServerError::Buffer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryError> for ServerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::CapacityExceeded => ServerError::MaximumConnectionsReached,
            other => ServerError::Registry(other),
        }
    }
}

impl From<BufferError> for ServerError {
    fn from(e: BufferError) -> Self {
        ServerError::Buffer(e)
    }
}
