//! Readiness bits and descriptor categories
//!
//! `Interest` is used both for what a descriptor is watched for and for
//! what `poll(2)` reported. The bit values are the POSIX `POLL*` constants,
//! so a registry entry can be handed to the kernel unchanged.

use core::fmt;

bitflags::bitflags! {
    /// Interest / readiness mask (`events` / `revents` of a `struct pollfd`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: i16 {
        /// Data can be read (`POLLIN`)
        const READABLE = libc::POLLIN;
        /// Data can be written (`POLLOUT`)
        const WRITABLE = libc::POLLOUT;
        /// Peer hung up (`POLLHUP`)
        const HUNGUP = libc::POLLHUP;
        /// Error condition (`POLLERR`)
        const ERROR = libc::POLLERR;
        /// Descriptor not open (`POLLNVAL`)
        const INVALID = libc::POLLNVAL;
    }
}

impl Interest {
    /// Any of the exceptional conditions
    pub const EXCEPTIONAL: Interest = Interest::HUNGUP
        .union(Interest::ERROR)
        .union(Interest::INVALID);

    /// Whether nothing was reported
    #[inline]
    pub fn is_idle(self) -> bool {
        self.is_empty()
    }

    /// Whether any of `HUNGUP`, `ERROR`, `INVALID` is set
    #[inline]
    pub fn is_exceptional(self) -> bool {
        self.intersects(Self::EXCEPTIONAL)
    }
}

/// What a watched descriptor is. Fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Listening server socket
    Listener,
    /// Accepted client connection
    ClientSocket,
    /// One end of a CGI pipe
    Pipe,
    /// Regular file (log files)
    RegularFile,
}

impl Category {
    /// Whether output for this category is batched behind a watermark.
    ///
    /// Files amortize syscalls; sockets and pipes must drain promptly.
    #[inline]
    pub fn is_file_like(self) -> bool {
        matches!(self, Category::RegularFile)
    }

    /// Whether writes go through `send(2)` rather than `write(2)`
    #[inline]
    pub fn is_socket(self) -> bool {
        matches!(self, Category::Listener | Category::ClientSocket)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Listener => write!(f, "listener"),
            Category::ClientSocket => write!(f, "client"),
            Category::Pipe => write!(f, "pipe"),
            Category::RegularFile => write!(f, "file"),
        }
    }
}
