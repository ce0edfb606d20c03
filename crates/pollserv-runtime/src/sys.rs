//! `libc` descriptor I/O
//!
//! [`SysIo`] is the production [`DescriptorIo`]: thin wrappers over
//! `write(2)`, `send(2)` and a single-descriptor `poll(2)`. The free
//! functions cover the read side and descriptor flags.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use pollserv_core::DescriptorIo;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
    } else {
        // SIGPIPE is ignored process-wide by the signal module.
        const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;
    }
}

/// Chunk size for draining readable descriptors
const READ_CHUNK: usize = 16 * 1024;

#[inline]
fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Real syscalls
#[derive(Debug, Default, Clone, Copy)]
pub struct SysIo;

impl DescriptorIo for SysIo {
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        cvt(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
    }

    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        cvt(unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS) })
    }

    fn wait_writable(&self, fd: RawFd, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(&mut pfd, 1, ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        Ok(n > 0 && pfd.revents & libc::POLLOUT != 0)
    }
}

/// What one drain of a readable descriptor produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    /// Bytes appended this call
    pub bytes: usize,
    /// Peer closed its end
    pub eof: bool,
}

/// Read everything currently available on a non-blocking descriptor into
/// `into`, stopping at would-block, EOF, or once `into` holds `limit`
/// bytes.
pub fn read_available(fd: RawFd, into: &mut Vec<u8>, limit: usize) -> io::Result<ReadStatus> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut status = ReadStatus { bytes: 0, eof: false };

    while into.len() < limit {
        let want = READ_CHUNK.min(limit - into.len());
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, want) };
        match cvt(n) {
            Ok(0) => {
                status.eof = true;
                break;
            }
            Ok(n) => {
                into.extend_from_slice(&chunk[..n]);
                status.bytes += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(status)
}

/// Put a descriptor in non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mark a descriptor close-on-exec
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
