//! Write capability driven by the buffer store
//!
//! The buffer store decides *when* and *how much* to write; an implementor
//! of [`DescriptorIo`] performs the actual syscall. The runtime provides
//! the `libc` implementation, tests provide recording mocks.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Non-blocking write primitives on raw descriptors.
///
/// **Contract:**
/// - Calls never block the thread (except `wait_writable`, bounded by its
///   timeout).
/// - "Would block" is reported as `io::ErrorKind::WouldBlock`, an
///   interrupted call as `io::ErrorKind::Interrupted`; callers treat both
///   as zero progress.
pub trait DescriptorIo {
    /// `write(2)` for pipes and regular files. Returns bytes written.
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    /// `send(2)` for sockets, without raising `SIGPIPE`. Returns bytes sent.
    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    /// Wait until `fd` accepts more data or `timeout` elapses.
    ///
    /// Only used on the shutdown path. Returns `Ok(false)` on timeout.
    fn wait_writable(&self, fd: RawFd, timeout: Duration) -> io::Result<bool>;
}

impl<T: DescriptorIo + ?Sized> DescriptorIo for &T {
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        (**self).write(fd, buf)
    }

    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        (**self).send(fd, buf)
    }

    fn wait_writable(&self, fd: RawFd, timeout: Duration) -> io::Result<bool> {
        (**self).wait_writable(fd, timeout)
    }
}

/// Whether an I/O error only means "try again later"
#[inline]
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
