//! Per-descriptor output buffering
//!
//! Bytes destined for a descriptor are queued here and written out when the
//! reactor sees the descriptor writable. A stream is created lazily by the
//! first non-empty push and lives until `destroy`.
//!
//! Two flush policies:
//! - **Threshold** (regular files): writes are batched until the queue
//!   reaches a watermark; `push` reports `FlushRequested` once it does.
//! - **BestEffort** (sockets, pipes): every flush attempts to send the whole
//!   queue.
//!
//! Both are bounded by a hard cap. A push that would exceed it is refused
//! with `Overflow` and leaves the stream untouched.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::constants::{DEFAULT_FLUSH_THRESHOLD, DEFAULT_MAX_BUFFER_SIZE, SOCKET_BUFFER_RESERVE};
use crate::error::BufferError;
use crate::interest::Category;
use crate::traits::{is_transient, DescriptorIo};

/// When a stream writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Write only once this many bytes are queued, or when forced
    Threshold(usize),
    /// Always try to write everything
    BestEffort,
}

impl FlushPolicy {
    /// Policy for a descriptor category
    pub fn for_category(category: Category, threshold: usize) -> Self {
        if category.is_file_like() {
            FlushPolicy::Threshold(threshold)
        } else {
            FlushPolicy::BestEffort
        }
    }
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Queued, nothing else to do
    Buffered,
    /// Queued, and the threshold stream reached its watermark
    FlushRequested,
    /// Refused: the stream would exceed its cap
    Overflow,
}

#[derive(Debug)]
struct Stream {
    data: Vec<u8>,
    category: Category,
    policy: FlushPolicy,
}

impl Stream {
    fn new(category: Category, threshold: usize) -> Self {
        let policy = FlushPolicy::for_category(category, threshold);
        let reserve = match policy {
            FlushPolicy::Threshold(t) => t,
            FlushPolicy::BestEffort => SOCKET_BUFFER_RESERVE,
        };
        Self { data: Vec::with_capacity(reserve), category, policy }
    }
}

/// Output queues keyed by descriptor
pub struct BufferStore<I: DescriptorIo> {
    io: I,
    streams: HashMap<RawFd, Stream>,
    flush_threshold: usize,
    max_size: usize,
}

impl<I: DescriptorIo> BufferStore<I> {
    /// Create a store with the given watermark and per-stream cap
    pub fn new(io: I, flush_threshold: usize, max_size: usize) -> Self {
        Self {
            io,
            streams: HashMap::new(),
            flush_threshold,
            max_size,
        }
    }

    /// Create a store with the default 32 KB watermark and 32 MB cap
    pub fn with_defaults(io: I) -> Self {
        Self::new(io, DEFAULT_FLUSH_THRESHOLD, DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Queue `bytes` for `fd`.
    ///
    /// The category picks the flush policy when the stream is created; a
    /// later push with a different category does not change it.
    pub fn push(&mut self, fd: RawFd, category: Category, bytes: &[u8]) -> PushStatus {
        let queued = self.remaining(fd);
        if queued.saturating_add(bytes.len()) > self.max_size {
            return PushStatus::Overflow;
        }
        if bytes.is_empty() {
            return PushStatus::Buffered;
        }

        let threshold = self.flush_threshold;
        let stream = self
            .streams
            .entry(fd)
            .or_insert_with(|| Stream::new(category, threshold));
        stream.data.extend_from_slice(bytes);

        match stream.policy {
            FlushPolicy::Threshold(t) if stream.data.len() >= t => PushStatus::FlushRequested,
            _ => PushStatus::Buffered,
        }
    }

    /// Write out as much of the stream as the descriptor accepts.
    ///
    /// Returns the bytes still queued. A threshold stream below its watermark
    /// is left alone unless `force` is set. Missing streams report 0.
    pub fn flush(&mut self, fd: RawFd, force: bool) -> Result<usize, BufferError> {
        let Some(stream) = self.streams.get_mut(&fd) else {
            return Ok(0);
        };

        if let FlushPolicy::Threshold(t) = stream.policy {
            if !force && stream.data.len() < t {
                return Ok(stream.data.len());
            }
        }

        let mut written = 0;
        let mut failure = None;
        while written < stream.data.len() {
            let pending = &stream.data[written..];
            let result = if stream.category.is_socket() {
                self.io.send(fd, pending)
            } else {
                self.io.write(fd, pending)
            };
            match result {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    failure = Some(e.raw_os_error().unwrap_or(libc::EIO));
                    break;
                }
            }
        }

        stream.data.drain(..written);
        match failure {
            Some(errno) => Err(BufferError::Io { fd, errno }),
            None => Ok(stream.data.len()),
        }
    }

    /// Drop the stream for `fd` without writing it
    pub fn destroy(&mut self, fd: RawFd) {
        self.streams.remove(&fd);
    }

    /// Queued bytes for `fd` (empty if there is no stream)
    pub fn peek(&self, fd: RawFd) -> &[u8] {
        self.streams.get(&fd).map(|s| s.data.as_slice()).unwrap_or(&[])
    }

    /// Number of queued bytes for `fd`
    #[inline]
    pub fn remaining(&self, fd: RawFd) -> usize {
        self.streams.get(&fd).map_or(0, |s| s.data.len())
    }

    /// Whether a stream exists for `fd`
    #[inline]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.streams.contains_key(&fd)
    }

    /// Flush policy of the stream for `fd`
    pub fn policy(&self, fd: RawFd) -> Option<FlushPolicy> {
        self.streams.get(&fd).map(|s| s.policy)
    }

    /// Number of live streams
    #[inline]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether there are no streams
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Flush watermark for threshold streams
    #[inline]
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Per-stream cap
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The write capability
    #[inline]
    pub fn io(&self) -> &I {
        &self.io
    }

    /// Force every stream out, waiting for writability in between, until
    /// all are empty or `deadline` passes. All streams are dropped
    /// afterwards. Returns the number of bytes that could not be written.
    pub fn drain_all(&mut self, deadline: Instant) -> usize {
        let mut fds: Vec<RawFd> = self.streams.keys().copied().collect();
        fds.sort_unstable();

        let mut lost = 0;
        for fd in fds {
            loop {
                let remaining = match self.flush(fd, true) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => {
                        lost += self.remaining(fd);
                        break;
                    }
                };
                let now = Instant::now();
                if now >= deadline {
                    lost += remaining;
                    break;
                }
                match self.io.wait_writable(fd, deadline - now) {
                    Ok(true) => continue,
                    _ => {
                        lost += remaining;
                        break;
                    }
                }
            }
        }

        self.streams.clear();
        lost
    }
}

// ============================================================================
// Tests
// ============================================================================
