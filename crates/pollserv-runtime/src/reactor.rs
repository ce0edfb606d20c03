//! # The reactor
//!
//! One thread, one `poll(2)` per tick:
//!
//! ```text
//! loop {
//!     1. Register log files that asked to be flushed (write interest)
//!     2. poll() every watched descriptor, bounded by the poll timeout
//!     3. Visit each ready descriptor once, by category:
//!          Listener     → accept one client
//!          ClientSocket → read + handler / flush the response / cleanup
//!          Pipe         → collect CGI output / stream the request body
//!          RegularFile  → flush buffered log lines
//!     4. Every GC interval: expire sessions, reap children, flush logs
//! }
//! ```
//!
//! The reactor owns the registry, the buffer store, the connection
//! directory and the logger; the handler sees them only through a
//! [`HandlerContext`] for the duration of one call.
//!
//! Removing a descriptor swaps the last entry into its slot, so the
//! dispatch cursor only advances when the slot still holds the descriptor
//! it just handled.

use std::fmt;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use pollserv_core::error::last_errno;
use pollserv_core::{
    kerror, kwarn, BufferStore, Category, Descriptor, DescriptorIo, Interest, LogLevel, Registry, RegistryError,
    ServerError, ServerResult,
};

use crate::cgi::{kill_child, reap_children, CgiProcess};
use crate::config::ServerConfig;
use crate::connection::{ConnectionDirectory, Phase};
use crate::handler::{HandlerContext, Outcome, RequestHandler};
use crate::logger::Logger;
use crate::net::{self, Accepted, Listener};
use crate::signal;
use crate::sys::{read_available, SysIo};

/// Error log line through the reactor's own logger
macro_rules! rlog {
    ($self:ident, $level:ident, $($arg:tt)*) => {
        $self.logger.log(&mut $self.buffers, LogLevel::$level, format_args!($($arg)*))
    };
}

/// Handler context borrowed from the reactor's fields
macro_rules! handler_ctx {
    ($self:ident) => {
        HandlerContext {
            connections: &mut $self.connections,
            buffers: &mut $self.buffers,
            logger: &mut $self.logger,
        }
    };
}

/// Counters kept by the reactor
#[derive(Debug, Clone, Default)]
pub struct ReactorStats {
    /// poll() calls
    pub ticks: u64,

    /// Clients accepted and tracked
    pub accepted: u64,

    /// Clients dropped right after accept
    pub rejected: u64,

    /// Responses written out completely
    pub completed: u64,

    /// CGI children attached to a client
    pub cgi_spawned: u64,

    /// CGI children that ended in an error response
    pub cgi_failed: u64,
}

/// Single-threaded HTTP reactor
pub struct Reactor<H: RequestHandler, I: DescriptorIo = SysIo> {
    config: ServerConfig,
    registry: Registry,
    buffers: BufferStore<I>,
    connections: ConnectionDirectory,
    logger: Logger,
    handler: H,
    listeners: Vec<SocketAddrV4>,
    stats: ReactorStats,
}

impl<H: RequestHandler> Reactor<H, SysIo> {
    /// Reactor writing through `libc`
    pub fn new(config: ServerConfig, logger: Logger, handler: H) -> ServerResult<Self> {
        Self::with_io(config, logger, handler, SysIo)
    }
}

impl<H: RequestHandler, I: DescriptorIo> Reactor<H, I> {
    /// Reactor writing through `io`. The config is validated here.
    pub fn with_io(config: ServerConfig, logger: Logger, handler: H, io: I) -> ServerResult<Self> {
        config.validate().map_err(ServerError::Config)?;
        Ok(Self {
            registry: Registry::with_capacity(config.registry_capacity()),
            buffers: BufferStore::new(io, config.flush_threshold, config.max_buffer_size),
            connections: ConnectionDirectory::new(config.session_timeout, config.gc_interval),
            config,
            logger,
            handler,
            listeners: Vec::new(),
            stats: ReactorStats::default(),
        })
    }

    /// Bind every configured listen address
    pub fn listen_all(&mut self) -> ServerResult<Vec<SocketAddrV4>> {
        let addrs = self.config.listen.clone();
        addrs.into_iter().map(|addr| self.listen(addr)).collect()
    }

    /// Bind one listener and watch it. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddrV4) -> ServerResult<SocketAddrV4> {
        let listener = Listener::bind(addr, self.config.backlog)?;
        let local = listener.local_addr();
        self.registry
            .register(Descriptor::Owned(listener.into_fd()), Category::Listener, Interest::READABLE)?;
        self.listeners.push(local);
        rlog!(self, Info, "listening on {}", local);
        Ok(local)
    }

    /// Track an already connected, non-blocking client socket
    pub fn adopt(&mut self, client: Accepted) -> ServerResult<RawFd> {
        let fd = self.connections.accept(&mut self.registry, client)?;
        self.stats.accepted += 1;
        Ok(fd)
    }

    /// Serve until SIGINT/SIGTERM or a fatal error
    pub fn run(&mut self) -> ServerResult<()> {
        self.run_while(|_| !signal::shutdown_requested())
    }

    /// Serve while `keep_going` holds, checked before every tick.
    ///
    /// Whatever ends the loop, buffers are drained before returning.
    pub fn run_while<F>(&mut self, mut keep_going: F) -> ServerResult<()>
    where
        F: FnMut(&Self) -> bool,
    {
        rlog!(
            self,
            Info,
            "pollserv running on {} ({} listener(s), {} descriptor slots)",
            crate::PLATFORM,
            self.listeners.len(),
            self.registry.capacity()
        );

        let result = loop {
            if !keep_going(self) {
                break Ok(());
            }
            if let Err(e) = self.tick() {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => rlog!(self, Info, "shutting down"),
            Err(e) => rlog!(self, Critical, "{}", e),
        }
        self.shutdown();
        result
    }

    /// One iteration: flush registrations, poll, dispatch, periodic work.
    /// Returns the number of ready descriptors. Errors are fatal.
    pub fn tick(&mut self) -> ServerResult<usize> {
        self.register_log_flushes();
        let ready = self.poll(self.config.poll_timeout)?;
        if ready > 0 {
            self.dispatch()?;
        }
        self.periodic(Instant::now());
        Ok(ready)
    }

    /// Block in `poll(2)` for at most `timeout`. `EINTR` counts as an empty
    /// tick.
    pub fn poll(&mut self, timeout: Duration) -> ServerResult<usize> {
        self.stats.ticks += 1;
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let fds = self.registry.as_pollfds_mut();
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match last_errno() {
            libc::EINTR => Ok(0),
            errno => Err(ServerError::Poll(errno)),
        }
    }

    /// Handle every descriptor with readiness set, each at most once
    pub fn dispatch(&mut self) -> ServerResult<()> {
        let mut i = 0;
        while i < self.registry.len() {
            let fd = self.registry.descriptor(i);
            let ready = self.registry.readiness(i);
            if !ready.is_idle() {
                self.registry.set_readiness(i, Interest::empty());
                match self.registry.category(i) {
                    Category::Listener => self.on_listener(fd, ready)?,
                    Category::ClientSocket => self.on_client(fd, ready),
                    Category::Pipe => self.on_pipe(fd, ready),
                    Category::RegularFile => self.on_log_file(fd, ready),
                }
            }
            // A removal moved another entry into slot i; visit it next.
            if i < self.registry.len() && self.registry.descriptor(i) == fd {
                i += 1;
            }
        }
        Ok(())
    }

    // ── Listener ──

    fn on_listener(&mut self, fd: RawFd, ready: Interest) -> ServerResult<()> {
        if ready.contains(Interest::ERROR) {
            return Err(ServerError::ServerSocket(fd));
        }
        if ready.contains(Interest::HUNGUP) {
            return Err(ServerError::ServerSocketClosed(fd));
        }
        if ready.contains(Interest::INVALID) {
            return Err(ServerError::ServerSocketInvalid(fd));
        }
        if ready.contains(Interest::READABLE) {
            self.accept_from(fd);
        }
        Ok(())
    }

    fn accept_from(&mut self, listener: RawFd) {
        let client = match net::accept(listener) {
            Ok(Some(client)) => client,
            Ok(None) => return,
            Err(e) => {
                rlog!(self, Warning, "{}", e);
                return;
            }
        };
        let (ip, port) = (client.ip, client.port);

        // Accepted and dropped, so the peer sees a close instead of a
        // connection stuck in the backlog.
        if self.connections.len() >= self.config.max_connections {
            self.stats.rejected += 1;
            rlog!(self, Warning, "{}: dropping {}:{}", ServerError::MaximumConnectionsReached, ip, port);
            return;
        }
        match self.connections.accept(&mut self.registry, client) {
            Ok(fd) => {
                self.stats.accepted += 1;
                rlog!(self, Debug, "client {} connected from {}:{}", fd, ip, port);
            }
            Err(e) => {
                self.stats.rejected += 1;
                rlog!(self, Warning, "{}: dropping {}:{}", ServerError::from(e), ip, port);
            }
        }
    }

    // ── Client sockets ──

    fn on_client(&mut self, fd: RawFd, ready: Interest) {
        if ready.contains(Interest::HUNGUP) {
            rlog!(self, Debug, "client {} hung up", fd);
            self.close_client(fd);
            return;
        }
        if ready.contains(Interest::INVALID) {
            self.fail_client(fd, 400);
            return;
        }
        if ready.contains(Interest::ERROR) {
            self.fail_client(fd, 500);
            return;
        }
        if ready.contains(Interest::READABLE) {
            self.read_client(fd);
        }
        if ready.contains(Interest::WRITABLE) {
            self.write_client(fd);
        }
    }

    fn read_client(&mut self, fd: RawFd) {
        let limit = self.config.max_request_size.saturating_add(1);
        let Some(conn) = self.connections.get_mut(fd) else {
            self.close_client(fd);
            return;
        };
        if conn.phase != Phase::Reading {
            return;
        }

        let status = match read_available(fd, conn.request.buffer_mut(), limit) {
            Ok(status) => status,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                rlog!(self, Debug, "{}", ServerError::Read { fd, errno });
                self.close_client(fd);
                return;
            }
        };
        conn.last_access = Instant::now();
        if status.eof && conn.request.received() == 0 {
            rlog!(self, Debug, "client {} closed without a request", fd);
            self.close_client(fd);
            return;
        }
        if status.bytes == 0 && !status.eof {
            return;
        }

        let outcome = {
            let mut ctx = handler_ctx!(self);
            self.handler.handle_request(&mut ctx, fd)
        };
        match outcome {
            Outcome::Static | Outcome::ErrorBuffered => self.arm_response(fd),
            Outcome::CgiSpawned(child) => self.attach_cgi(fd, child),
            Outcome::Pending if status.eof => {
                rlog!(self, Debug, "client {} closed with an incomplete request", fd);
                self.close_client(fd);
            }
            Outcome::Pending => {}
        }
    }

    fn write_client(&mut self, fd: RawFd) {
        if self.connections.get(fd).map(|conn| conn.phase) != Some(Phase::Responding) {
            return;
        }
        match self.buffers.flush(fd, false) {
            Ok(0) => {
                self.stats.completed += 1;
                self.close_client(fd);
            }
            Ok(_) => {}
            Err(e) => {
                rlog!(self, Debug, "{}", e);
                self.close_client(fd);
            }
        }
    }

    /// Exceptional client: answer with `status`, or give up if a response
    /// is already on its way.
    fn fail_client(&mut self, fd: RawFd, status: u16) {
        let phase = self.connections.get(fd).map(|conn| conn.phase);
        match phase {
            Some(Phase::Reading) | Some(Phase::AwaitingCgi) => {
                rlog!(self, Warning, "client {} in error, answering {}", fd, status);
                self.close_cgi(fd);
                self.buffers.destroy(fd);
                let mut ctx = handler_ctx!(self);
                self.handler.handle_error_response(&mut ctx, fd, status);
                self.arm_response(fd);
            }
            Some(Phase::Responding) | None => {
                rlog!(self, Debug, "client {} in error, closing", fd);
                self.close_client(fd);
            }
        }
    }

    /// Switch `client` to write interest only
    fn arm_response(&mut self, client: RawFd) {
        if let Some(index) = self.registry.index_of(client) {
            self.registry.set_interest(index, Interest::WRITABLE);
        }
    }

    /// Forget a client: its pipes, its buffer, its registry slot (closing
    /// the socket)
    fn close_client(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.release(fd) {
            if let Some(link) = &conn.cgi {
                for pipe in link.open_pipes() {
                    self.buffers.destroy(pipe);
                    self.registry.remove_fd(pipe);
                }
            }
        }
        self.buffers.destroy(fd);
        self.registry.remove_fd(fd);
    }

    // ── CGI pipes ──

    fn attach_cgi(&mut self, client: RawFd, child: CgiProcess) {
        let CgiProcess { pid, response_read, request_write } = child;
        let response_fd = response_read.as_raw_fd();
        let request_fd = request_write.as_raw_fd();

        if let Err(e) = self.register_pipes(response_read, request_write) {
            rlog!(self, Error, "CGI pid {} for client {}: {}", pid, client, ServerError::from(e));
            if let Err(e) = kill_child(pid) {
                rlog!(self, Error, "{}", e);
            }
            self.buffers.destroy(request_fd);
            self.stats.cgi_failed += 1;
            let mut ctx = handler_ctx!(self);
            self.handler.handle_error_response(&mut ctx, client, 503);
            self.arm_response(client);
            return;
        }

        self.connections.bind_cgi(client, pid, response_fd, request_fd);
        self.stats.cgi_spawned += 1;
        // Nothing to do on the client until the CGI is done.
        if let Some(index) = self.registry.index_of(client) {
            self.registry.set_interest(index, Interest::empty());
        }
    }

    fn register_pipes(&mut self, response: OwnedFd, request: OwnedFd) -> Result<(), RegistryError> {
        let response_fd = response.as_raw_fd();
        self.registry
            .register(Descriptor::Owned(response), Category::Pipe, Interest::READABLE)?;
        if let Err(e) = self
            .registry
            .register(Descriptor::Owned(request), Category::Pipe, Interest::WRITABLE)
        {
            self.registry.remove_fd(response_fd);
            return Err(e);
        }
        Ok(())
    }

    fn on_pipe(&mut self, fd: RawFd, ready: Interest) {
        let Some(client) = self.connections.client_for_pipe(fd) else {
            rlog!(self, Debug, "closing unrouted pipe {}", fd);
            self.buffers.destroy(fd);
            self.registry.remove_fd(fd);
            return;
        };
        if self.connections.is_response_pipe(fd) {
            self.on_response_pipe(client, fd, ready);
        } else {
            self.on_request_pipe(fd, ready);
        }
    }

    fn on_response_pipe(&mut self, client: RawFd, pipe: RawFd, ready: Interest) {
        if ready.intersects(Interest::ERROR | Interest::INVALID) {
            rlog!(self, Error, "CGI response pipe {} for client {} failed", pipe, client);
            self.cgi_failed(client, pipe);
            return;
        }
        if !ready.intersects(Interest::READABLE | Interest::HUNGUP) {
            return;
        }

        let cap = self.buffers.max_size();
        let Some(link) = self.connections.get_mut(client).and_then(|conn| conn.cgi.as_mut()) else {
            return;
        };
        let status = read_available(pipe, &mut link.output, cap.saturating_add(1));
        let collected = link.output.len();

        match status {
            Err(e) => {
                rlog!(self, Error, "reading CGI output for client {}: {}", client, e);
                self.cgi_failed(client, pipe);
            }
            Ok(_) if collected > cap => {
                rlog!(self, Error, "CGI output for client {} exceeds {} bytes", client, cap);
                self.cgi_failed(client, pipe);
            }
            Ok(status) if status.eof => self.cgi_finished(client, pipe),
            Ok(_) => {}
        }
    }

    fn on_request_pipe(&mut self, pipe: RawFd, ready: Interest) {
        if ready.intersects(Interest::ERROR | Interest::HUNGUP | Interest::INVALID) {
            rlog!(self, Debug, "CGI stopped reading request pipe {}", pipe);
            self.close_pipe(pipe);
            return;
        }
        if !ready.contains(Interest::WRITABLE) {
            return;
        }
        match self.buffers.flush(pipe, false) {
            Ok(0) => self.close_pipe(pipe),
            Ok(_) => {}
            Err(e) => {
                rlog!(self, Debug, "{}", e);
                self.close_pipe(pipe);
            }
        }
    }

    fn cgi_finished(&mut self, client: RawFd, pipe: RawFd) {
        let armed = {
            let mut ctx = handler_ctx!(self);
            self.handler.handle_pipe_read(&mut ctx, pipe)
        };
        self.close_cgi(client);
        if let Some(client) = armed {
            self.arm_response(client);
        }
    }

    fn cgi_failed(&mut self, client: RawFd, pipe: RawFd) {
        self.stats.cgi_failed += 1;
        let armed = {
            let mut ctx = handler_ctx!(self);
            self.handler.handle_pipe_exception(&mut ctx, pipe)
        };
        self.close_cgi(client);
        if let Some(client) = armed {
            self.arm_response(client);
        }
    }

    /// Close whichever of the client's pipes are still open
    fn close_cgi(&mut self, client: RawFd) {
        let pipes: Vec<RawFd> = self
            .connections
            .get(client)
            .and_then(|conn| conn.cgi.as_ref())
            .map(|link| link.open_pipes().collect())
            .unwrap_or_default();
        for pipe in pipes {
            self.close_pipe(pipe);
        }
    }

    fn close_pipe(&mut self, pipe: RawFd) {
        self.connections.unbind_pipe(pipe);
        self.buffers.destroy(pipe);
        self.registry.remove_fd(pipe);
    }

    // ── Log files ──

    fn register_log_flushes(&mut self) {
        for fd in self.logger.take_flush_requests() {
            if self.registry.contains(fd) {
                continue;
            }
            if let Err(e) = self
                .registry
                .register(Descriptor::Shared(fd), Category::RegularFile, Interest::WRITABLE)
            {
                kwarn!("log file {} not scheduled for flushing: {}", fd, e);
            }
        }
    }

    fn on_log_file(&mut self, fd: RawFd, ready: Interest) {
        if ready.is_exceptional() {
            self.disable_log(fd, "descriptor error");
            return;
        }
        if !ready.contains(Interest::WRITABLE) {
            return;
        }
        match self.buffers.flush(fd, true) {
            Ok(0) => {
                self.registry.remove_fd(fd);
            }
            Ok(_) => {}
            Err(e) => self.disable_log(fd, e),
        }
    }

    fn disable_log(&mut self, fd: RawFd, reason: impl fmt::Display) {
        self.buffers.destroy(fd);
        self.registry.remove_fd(fd);
        self.logger.disable(fd);
        kerror!("log file {} disabled: {}", fd, reason);
    }

    // ── Periodic work and shutdown ──

    fn periodic(&mut self, now: Instant) {
        let Some(expired) = self.connections.collect_garbage(now) else {
            return;
        };
        let reaped = reap_children();
        if expired > 0 || reaped > 0 {
            rlog!(self, Debug, "gc: {} session(s) expired, {} child(ren) reaped", expired, reaped);
        }
        self.logger.request_flush_all(&self.buffers);
    }

    /// Log the counters and write out every buffer, giving up after the
    /// drain timeout. Returns the bytes that could not be written.
    pub fn shutdown(&mut self) -> usize {
        let stats = self.stats.clone();
        rlog!(
            self,
            Info,
            "{} response(s) over {} connection(s), {} rejected, {} CGI run(s), {} failed",
            stats.completed,
            stats.accepted,
            stats.rejected,
            stats.cgi_spawned,
            stats.cgi_failed
        );
        let deadline = Instant::now() + self.config.drain_timeout;
        let lost = self.buffers.drain_all(deadline);
        if lost > 0 {
            kwarn!("{} buffered byte(s) lost at shutdown", lost);
        }
        lost
    }

    // ── Accessors ──

    /// Error log line at `level`
    pub fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.logger.log(&mut self.buffers, level, args);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[doc(hidden)]
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn buffers(&self) -> &BufferStore<I> {
        &self.buffers
    }

    pub fn connections(&self) -> &ConnectionDirectory {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionDirectory {
        &mut self.connections
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Bound listener addresses
    pub fn listeners(&self) -> &[SocketAddrV4] {
        &self.listeners
    }

    pub fn stats(&self) -> &ReactorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgi::spawn_child_process;
    use crate::config::LogTarget;
    use crate::message::Response;
    use std::ffi::OsStr;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    /// Answers every complete request with "hello"
    struct Hello;

    impl RequestHandler for Hello {
        fn handle_request<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome {
            let Some(conn) = ctx.connections.get_mut(client) else {
                return Outcome::Pending;
            };
            match conn.request.poll_complete(1024) {
                Ok(true) => {
                    ctx.respond(client, Response::ok("text/plain", b"hello".to_vec()));
                    Outcome::Static
                }
                Ok(false) => Outcome::Pending,
                Err(status) => {
                    self.handle_error_response(ctx, client, status);
                    Outcome::ErrorBuffered
                }
            }
        }
    }

    /// Runs a shell snippet as the CGI for every complete request
    struct Shell(&'static str);

    impl RequestHandler for Shell {
        fn handle_request<I: DescriptorIo>(&mut self, ctx: &mut HandlerContext<'_, I>, client: RawFd) -> Outcome {
            let Some(conn) = ctx.connections.get_mut(client) else {
                return Outcome::Pending;
            };
            if conn.request.poll_complete(1024) != Ok(true) {
                return Outcome::Pending;
            }
            let body = conn.request.body().to_vec();
            let child = spawn_child_process(
                Path::new("/bin/sh"),
                &[OsStr::new("-c"), OsStr::new(self.0)],
                std::iter::empty::<(&str, &str)>(),
                None,
            )
            .unwrap();
            ctx.buffers.push(child.request_write.as_raw_fd(), Category::Pipe, &body);
            Outcome::CgiSpawned(child)
        }
    }

    fn config() -> ServerConfig {
        ServerConfig::new()
            .listen_only([SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)])
            .poll_timeout(Duration::from_millis(10))
            .drain_timeout(Duration::from_millis(200))
    }

    fn connect_pair<H: RequestHandler>(reactor: &mut Reactor<H>) -> (RawFd, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = reactor
            .adopt(Accepted { fd: OwnedFd::from(ours), ip: Ipv4Addr::LOCALHOST, port: 5555 })
            .unwrap();
        (fd, peer)
    }

    fn spin<H: RequestHandler>(reactor: &mut Reactor<H>, done: impl Fn(&Reactor<H>) -> bool) {
        for _ in 0..500 {
            if done(reactor) {
                return;
            }
            reactor.tick().unwrap();
        }
        panic!("reactor did not reach the expected state");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Reactor::new(config().max_connections(0), Logger::disabled(), Hello).err();
        assert!(matches!(err, Some(ServerError::Config(_))));
    }

    #[test]
    fn test_static_response_then_close() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Hello).unwrap();
        let (fd, mut peer) = connect_pair(&mut reactor);
        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        spin(&mut reactor, |r| !r.connections().contains(fd));

        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
        assert!(reactor.registry().is_empty());
        assert!(reactor.buffers().is_empty());
        assert_eq!(reactor.stats().completed, 1);
    }

    #[test]
    fn test_request_in_pieces() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Hello).unwrap();
        let (fd, mut peer) = connect_pair(&mut reactor);

        peer.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        reactor.tick().unwrap();
        assert_eq!(reactor.connections().get(fd).unwrap().phase, Phase::Reading);
        let i = reactor.registry().index_of(fd).unwrap();
        assert_eq!(reactor.registry().interest(i), Interest::READABLE);

        peer.write_all(b"\r\n").unwrap();
        spin(&mut reactor, |r| !r.connections().contains(fd));
        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn test_peer_close_cleans_up() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Hello).unwrap();
        let (fd, peer) = connect_pair(&mut reactor);
        let (quiet, quiet_peer) = connect_pair(&mut reactor);

        drop(peer);
        spin(&mut reactor, |r| !r.connections().contains(fd));
        assert!(!reactor.registry().contains(fd));
        assert!(reactor.connections().contains(quiet));

        quiet_peer.shutdown(std::net::Shutdown::Write).unwrap();
        spin(&mut reactor, |r| r.connections().is_empty());
        assert!(reactor.registry().is_empty());
        assert_eq!(reactor.stats().completed, 0);
    }

    #[test]
    fn test_exceptional_client_gets_error_then_closes() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Hello).unwrap();
        let (bad, _bad_peer) = connect_pair(&mut reactor);
        let (err, _err_peer) = connect_pair(&mut reactor);

        let i = reactor.registry().index_of(bad).unwrap();
        let j = reactor.registry().index_of(err).unwrap();
        reactor.registry_mut().set_readiness(i, Interest::INVALID);
        reactor.registry_mut().set_readiness(j, Interest::ERROR);
        reactor.dispatch().unwrap();

        assert!(reactor.buffers().peek(bad).starts_with(b"HTTP/1.1 400 "));
        assert!(reactor.buffers().peek(err).starts_with(b"HTTP/1.1 500 "));
        assert_eq!(reactor.registry().interest(i), Interest::WRITABLE);
        assert_eq!(reactor.connections().get(bad).unwrap().phase, Phase::Responding);

        // Failing again while responding gives up on the client.
        reactor.registry_mut().set_readiness(i, Interest::ERROR);
        reactor.dispatch().unwrap();
        assert!(!reactor.connections().contains(bad));
        assert!(reactor.registry().contains(err));
        assert!(!reactor.buffers().contains(bad));
    }

    #[test]
    fn test_listener_errors_are_fatal() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Hello).unwrap();
        let addr = reactor.listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(reactor.listeners(), &[addr]);

        let fd = reactor.registry().descriptor(0);
        for (ready, expected) in [
            (Interest::ERROR, ServerError::ServerSocket(fd)),
            (Interest::HUNGUP, ServerError::ServerSocketClosed(fd)),
            (Interest::INVALID, ServerError::ServerSocketInvalid(fd)),
        ] {
            reactor.registry_mut().set_readiness(0, ready);
            let err = reactor.dispatch().unwrap_err();
            assert!(err.is_fatal());
            assert_eq!(err, expected);
        }
    }

    #[test]
    fn test_accept_drops_over_capacity() {
        let mut reactor = Reactor::new(config().max_connections(1), Logger::disabled(), Hello).unwrap();
        let addrs = reactor.listen_all().unwrap();
        let _first = TcpStream::connect(addrs[0]).unwrap();
        let _second = TcpStream::connect(addrs[0]).unwrap();

        spin(&mut reactor, |r| r.stats().accepted + r.stats().rejected == 2);
        assert_eq!(reactor.stats().accepted, 1);
        assert_eq!(reactor.stats().rejected, 1);
        assert_eq!(reactor.connections().len(), 1);
        assert_eq!(reactor.registry().count(Category::ClientSocket), 1);
    }

    #[test]
    fn test_cgi_response_roundtrip() {
        signal::install_handlers().unwrap();
        let script = "printf 'Content-Type: text/plain\\r\\n\\r\\n'; cat";
        let mut reactor = Reactor::new(config(), Logger::disabled(), Shell(script)).unwrap();
        let (fd, mut peer) = connect_pair(&mut reactor);
        peer.write_all(b"POST /run HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").unwrap();

        spin(&mut reactor, |r| r.stats().cgi_spawned == 1);
        assert_eq!(reactor.connections().get(fd).unwrap().phase, Phase::AwaitingCgi);
        assert!(reactor.registry().count(Category::Pipe) >= 1);
        let i = reactor.registry().index_of(fd).unwrap();
        assert_eq!(reactor.registry().interest(i), Interest::empty());

        spin(&mut reactor, |r| !r.connections().contains(fd));
        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));

        assert_eq!(reactor.connections().pipe_count(), 0);
        assert!(reactor.registry().is_empty());
        assert_eq!(reactor.stats().cgi_failed, 0);
        reap_children();
    }

    #[test]
    fn test_silent_cgi_is_500() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Shell("exit 0")).unwrap();
        let (fd, mut peer) = connect_pair(&mut reactor);
        peer.write_all(b"GET /run HTTP/1.1\r\n\r\n").unwrap();

        spin(&mut reactor, |r| !r.connections().contains(fd));
        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 "));
        assert!(reactor.registry().is_empty());
        reap_children();
    }

    fn cgi_pipes<H: RequestHandler>(reactor: &Reactor<H>, client: RawFd) -> (u32, RawFd, RawFd) {
        let link = reactor.connections().get(client).unwrap().cgi.as_ref().unwrap();
        (link.pid, link.response_pipe.unwrap(), link.request_pipe.unwrap())
    }

    #[test]
    fn test_response_pipe_error_is_500() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Shell("sleep 5")).unwrap();
        let (fd, mut peer) = connect_pair(&mut reactor);
        peer.write_all(b"GET /run HTTP/1.1\r\n\r\n").unwrap();
        spin(&mut reactor, |r| r.stats().cgi_spawned == 1);

        let (pid, response_pipe, request_pipe) = cgi_pipes(&reactor, fd);
        let p = reactor.registry().index_of(response_pipe).unwrap();
        reactor.registry_mut().set_readiness(p, Interest::ERROR);
        reactor.dispatch().unwrap();

        assert!(reactor.buffers().peek(fd).starts_with(b"HTTP/1.1 500 "));
        assert!(!reactor.registry().contains(response_pipe));
        assert!(!reactor.registry().contains(request_pipe));
        assert_eq!(reactor.registry().count(Category::Pipe), 0);
        assert_eq!(reactor.connections().pipe_count(), 0);
        let i = reactor.registry().index_of(fd).unwrap();
        assert_eq!(reactor.registry().interest(i), Interest::WRITABLE);
        assert_eq!(reactor.connections().get(fd).unwrap().phase, Phase::Responding);
        assert_eq!(reactor.stats().cgi_failed, 1);

        spin(&mut reactor, |r| !r.connections().contains(fd));
        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 "));
        kill_child(pid).unwrap();
        reap_children();
    }

    #[test]
    fn test_request_pipe_hangup_drops_body() {
        let script = "sleep 0.2; printf 'Content-Type: text/plain\\r\\n\\r\\nlate'";
        let mut reactor = Reactor::new(config(), Logger::disabled(), Shell(script)).unwrap();
        let (fd, mut peer) = connect_pair(&mut reactor);
        peer.write_all(b"POST /run HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").unwrap();
        spin(&mut reactor, |r| r.stats().cgi_spawned == 1);

        let (_, response_pipe, request_pipe) = cgi_pipes(&reactor, fd);
        assert_eq!(reactor.buffers().peek(request_pipe), b"abc");
        let q = reactor.registry().index_of(request_pipe).unwrap();
        reactor.registry_mut().set_readiness(q, Interest::HUNGUP);
        reactor.dispatch().unwrap();

        assert!(!reactor.registry().contains(request_pipe));
        assert!(!reactor.buffers().contains(request_pipe));
        assert!(reactor.registry().contains(response_pipe));
        assert_eq!(reactor.connections().get(fd).unwrap().phase, Phase::AwaitingCgi);

        // The response pipe still decides the outcome.
        spin(&mut reactor, |r| !r.connections().contains(fd));
        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nlate"));
        assert_eq!(reactor.stats().cgi_failed, 0);
        assert!(reactor.registry().is_empty());
        reap_children();
    }

    #[test]
    fn test_log_file_error_disables_log() {
        let path = std::env::temp_dir().join(format!("pollserv-reactor-broken-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config = config()
            .flush_threshold(64)
            .error_log(LogTarget::File(path.clone()))
            .access_log(LogTarget::Off);
        let logger = Logger::open(&config).unwrap();
        let mut reactor = Reactor::new(config, logger, Hello).unwrap();
        let log_fd = reactor.logger().file_fds()[0];

        for i in 0..8 {
            reactor.log(LogLevel::Warning, format_args!("line {}", i));
        }
        reactor.register_log_flushes();
        let i = reactor.registry().index_of(log_fd).unwrap();
        assert_eq!(reactor.registry().category(i), Category::RegularFile);
        reactor.registry_mut().set_readiness(i, Interest::ERROR);
        reactor.dispatch().unwrap();

        assert!(!reactor.registry().contains(log_fd));
        assert!(!reactor.buffers().contains(log_fd));
        assert!(reactor.logger().file_fds().is_empty());

        reactor.log(LogLevel::Error, format_args!("after"));
        assert!(reactor.buffers().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_log_flush_registers_file_until_drained() {
        let path = std::env::temp_dir().join(format!("pollserv-reactor-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config = config()
            .flush_threshold(64)
            .error_log(LogTarget::File(path.clone()))
            .access_log(LogTarget::Off);
        let logger = Logger::open(&config).unwrap();
        let mut reactor = Reactor::new(config, logger, Hello).unwrap();

        for i in 0..8 {
            reactor.log(LogLevel::Warning, format_args!("line {}", i));
        }
        reactor.tick().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[WARNING] line 7\n"));
        assert_eq!(reactor.registry().count(Category::RegularFile), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_run_while_stops_and_drains() {
        let mut reactor = Reactor::new(config(), Logger::disabled(), Hello).unwrap();
        reactor.listen_all().unwrap();
        let result = reactor.run_while(|r| r.stats().ticks < 3);
        assert_eq!(result, Ok(()));
        assert_eq!(reactor.stats().ticks, 3);
        assert!(reactor.buffers().is_empty());
    }
}
