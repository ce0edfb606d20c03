//! Listener sockets
//!
//! IPv4 TCP listeners set up with raw `libc` calls, non-blocking from the
//! start, plus a non-blocking accept that reports the peer address.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use pollserv_core::error::last_errno;
use pollserv_core::{ServerError, ServerResult};

use crate::sys::{set_cloexec, set_nonblocking};

/// A bound, listening socket
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
    local: SocketAddrV4,
}

/// An accepted client
#[derive(Debug)]
pub struct Accepted {
    pub fd: OwnedFd,
    pub ip: Ipv4Addr,
    pub port: u16,
}

fn sockaddr_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

fn sockaddr_to(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

impl Listener {
    /// Create, configure, bind and listen.
    ///
    /// Port 0 picks an ephemeral port; `local_addr` reports it.
    pub fn bind(addr: SocketAddrV4, backlog: i32) -> ServerResult<Self> {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(ServerError::last_os(ServerError::SocketCreate));
        }
        // Closed on any early return from here on.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let opt: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of_val(&opt) as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(ServerError::last_os(ServerError::SocketSet));
        }
        set_cloexec(raw).map_err(|e| ServerError::SocketSet(e.raw_os_error().unwrap_or(0)))?;
        set_nonblocking(raw).map_err(|e| ServerError::SocketSet(e.raw_os_error().unwrap_or(0)))?;

        let sa = sockaddr_from(addr);
        let ret = unsafe {
            libc::bind(
                raw,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(&sa) as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(ServerError::last_os(ServerError::SocketBind));
        }

        if unsafe { libc::listen(raw, backlog) } != 0 {
            return Err(ServerError::last_os(ServerError::SocketListen));
        }

        let local = local_addr(raw).unwrap_or(addr);
        Ok(Self { fd, local })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Hand the descriptor over (to the registry)
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Listener {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

fn local_addr(fd: RawFd) -> Option<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of_val(&sa) as libc::socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    (ret == 0).then(|| sockaddr_to(&sa))
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
        const ACCEPT_SETS_FLAGS: bool = true;

        unsafe fn accept_raw(fd: RawFd, sa: *mut libc::sockaddr, len: *mut libc::socklen_t) -> RawFd {
            libc::accept4(fd, sa, len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
        }
    } else {
        const ACCEPT_SETS_FLAGS: bool = false;

        unsafe fn accept_raw(fd: RawFd, sa: *mut libc::sockaddr, len: *mut libc::socklen_t) -> RawFd {
            libc::accept(fd, sa, len)
        }
    }
}

/// Accept one pending connection.
///
/// The client socket is non-blocking and close-on-exec. `Ok(None)` means
/// nothing was pending.
pub fn accept(listener: RawFd) -> ServerResult<Option<Accepted>> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of_val(&sa) as libc::socklen_t;
    let sa_ptr = &mut sa as *mut _ as *mut libc::sockaddr;

    let raw = loop {
        let raw = unsafe { accept_raw(listener, sa_ptr, &mut len) };
        if raw >= 0 {
            break raw;
        }
        match last_errno() {
            libc::EINTR => continue,
            libc::EAGAIN | libc::ECONNABORTED => return Ok(None),
            #[allow(unreachable_patterns)]
            libc::EWOULDBLOCK => return Ok(None),
            errno => return Err(ServerError::ConnectionEstablishing(errno)),
        }
    };
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    if !ACCEPT_SETS_FLAGS {
        let errno = |e: std::io::Error| ServerError::ConnectionEstablishing(e.raw_os_error().unwrap_or(0));
        set_nonblocking(raw).map_err(errno)?;
        set_cloexec(raw).map_err(errno)?;
    }

    let peer = sockaddr_to(&sa);
    Ok(Some(Accepted { fd, ip: *peer.ip(), port: peer.port() }))
}
