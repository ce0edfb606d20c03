//! Connection directory
//!
//! Everything the reactor knows about a client beyond its registry slot:
//! the in-flight request and response, an optional CGI link, the session
//! it is bound to. Pipes route back to their client through `pipe_routes`.
//!
//! The directory never touches the registry except in `accept`; removing
//! and closing descriptors is the reactor's job.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use pollserv_core::{
    BufferStore, Category, Descriptor, DescriptorIo, Interest, PushStatus, Registry,
    RegistryError, SessionId, SessionStore,
};

use crate::message::{Request, Response};
use crate::net::Accepted;

/// Cookie carrying the session id
pub const SESSION_COOKIE: &str = "session";

/// Where a connection is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Receiving the request
    Reading,
    /// Waiting for CGI output
    AwaitingCgi,
    /// Response queued, draining to the socket
    Responding,
}

/// A client's CGI child and the parent ends of its pipes.
///
/// A pipe field becomes `None` once the reactor has closed that pipe.
#[derive(Debug)]
pub struct CgiLink {
    pub pid: u32,
    pub response_pipe: Option<RawFd>,
    pub request_pipe: Option<RawFd>,
    /// Child stdout collected so far
    pub output: Vec<u8>,
}

impl CgiLink {
    /// Pipes still open
    pub fn open_pipes(&self) -> impl Iterator<Item = RawFd> {
        self.response_pipe.into_iter().chain(self.request_pipe)
    }
}

/// One client connection
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    peer_ip: Ipv4Addr,
    peer_port: u16,
    pub request: Request,
    pub response: Response,
    pub cgi: Option<CgiLink>,
    pub session: Option<SessionId>,
    pub phase: Phase,
    pub last_access: Instant,
}

impl Connection {
    fn new(fd: RawFd, peer_ip: Ipv4Addr, peer_port: u16, now: Instant) -> Self {
        Self {
            fd,
            peer_ip,
            peer_port,
            request: Request::new(),
            response: Response::default(),
            cgi: None,
            session: None,
            phase: Phase::Reading,
            last_access: now,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_ip(&self) -> Ipv4Addr {
        self.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }
}

/// Client fd -> connection, pipe fd -> client fd, and the session store
#[derive(Debug)]
pub struct ConnectionDirectory {
    connections: HashMap<RawFd, Connection>,
    pipe_routes: HashMap<RawFd, RawFd>,
    sessions: SessionStore,
    gc_interval: Duration,
    last_gc: Instant,
}

impl ConnectionDirectory {
    pub fn new(session_timeout: Duration, gc_interval: Duration) -> Self {
        Self::starting_at(session_timeout, gc_interval, Instant::now())
    }

    /// Like `new`, with the GC clock started at `now`
    pub fn starting_at(session_timeout: Duration, gc_interval: Duration, now: Instant) -> Self {
        Self {
            connections: HashMap::new(),
            pipe_routes: HashMap::new(),
            sessions: SessionStore::new(session_timeout),
            gc_interval,
            last_gc: now,
        }
    }

    /// Register an accepted client for reading and start tracking it.
    ///
    /// On failure the socket is closed and nothing is tracked.
    pub fn accept(&mut self, registry: &mut Registry, client: Accepted) -> Result<RawFd, RegistryError> {
        let Accepted { fd, ip, port } = client;
        let index = registry.register(Descriptor::Owned(fd), Category::ClientSocket, Interest::READABLE)?;
        let fd = registry.descriptor(index);
        self.connections.insert(fd, Connection::new(fd, ip, port, Instant::now()));
        Ok(fd)
    }

    /// Attach a CGI child to `client` and route both pipes to it
    pub fn bind_cgi(&mut self, client: RawFd, pid: u32, response_pipe: RawFd, request_pipe: RawFd) -> bool {
        let Some(conn) = self.connections.get_mut(&client) else {
            return false;
        };
        conn.cgi = Some(CgiLink {
            pid,
            response_pipe: Some(response_pipe),
            request_pipe: Some(request_pipe),
            output: Vec::new(),
        });
        conn.phase = Phase::AwaitingCgi;
        self.pipe_routes.insert(response_pipe, client);
        self.pipe_routes.insert(request_pipe, client);
        true
    }

    /// Client a pipe belongs to
    pub fn client_for_pipe(&self, pipe: RawFd) -> Option<RawFd> {
        self.pipe_routes.get(&pipe).copied()
    }

    /// Whether `pipe` is the response (child stdout) end of its link
    pub fn is_response_pipe(&self, pipe: RawFd) -> bool {
        self.client_for_pipe(pipe)
            .and_then(|client| self.connections.get(&client))
            .and_then(|conn| conn.cgi.as_ref())
            .is_some_and(|link| link.response_pipe == Some(pipe))
    }

    /// Forget a pipe's route and clear it from the link. Returns the client.
    pub fn unbind_pipe(&mut self, pipe: RawFd) -> Option<RawFd> {
        let client = self.pipe_routes.remove(&pipe)?;
        if let Some(link) = self.connections.get_mut(&client).and_then(|c| c.cgi.as_mut()) {
            if link.response_pipe == Some(pipe) {
                link.response_pipe = None;
            }
            if link.request_pipe == Some(pipe) {
                link.request_pipe = None;
            }
        }
        Some(client)
    }

    /// Queue the client's response for sending.
    ///
    /// If the serialized response does not fit the buffer cap, whatever was
    /// queued is dropped and a 500 is queued instead. Returns the status and
    /// size actually queued.
    pub fn finalize_and_close<I: DescriptorIo>(
        &mut self,
        client: RawFd,
        buffers: &mut BufferStore<I>,
    ) -> Option<(u16, usize)> {
        let conn = self.connections.get_mut(&client)?;
        conn.phase = Phase::Responding;

        let bytes = conn.response.serialize();
        if buffers.push(client, Category::ClientSocket, &bytes) != PushStatus::Overflow {
            return Some((conn.response.status(), bytes.len()));
        }

        buffers.destroy(client);
        conn.response = Response::error(500);
        let bytes = conn.response.serialize();
        buffers.push(client, Category::ClientSocket, &bytes);
        Some((500, bytes.len()))
    }

    /// Stop tracking `client`. Routes of its pipes are dropped too; the
    /// returned connection still names them so the caller can close them.
    pub fn release(&mut self, client: RawFd) -> Option<Connection> {
        let conn = self.connections.remove(&client)?;
        if let Some(link) = &conn.cgi {
            for pipe in link.open_pipes() {
                self.pipe_routes.remove(&pipe);
            }
        }
        Some(conn)
    }

    /// Bind `client` to the session named by `presented`, or to a new one.
    ///
    /// A new or changed id is sent back in a `session` cookie.
    pub fn assign_session(&mut self, client: RawFd, presented: Option<SessionId>, now: Instant) -> Option<SessionId> {
        let conn = self.connections.get_mut(&client)?;
        let (id, created) = self.sessions.resolve(presented, now);
        if created || presented != Some(id) {
            conn.response.set_cookie(SESSION_COOKIE, &id.to_string());
        }
        conn.session = Some(id);
        Some(id)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionStore {
        &mut self.sessions
    }

    /// Evict expired sessions if the GC interval has elapsed since the last
    /// pass. Returns `None` when it was not yet time, else the count.
    pub fn collect_garbage(&mut self, now: Instant) -> Option<usize> {
        if now.saturating_duration_since(self.last_gc) < self.gc_interval {
            return None;
        }
        self.last_gc = now;
        Some(self.sessions.expire(now))
    }

    pub fn get(&self, client: RawFd) -> Option<&Connection> {
        self.connections.get(&client)
    }

    pub fn get_mut(&mut self, client: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&client)
    }

    pub fn contains(&self, client: RawFd) -> bool {
        self.connections.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of routed pipes
    pub fn pipe_count(&self) -> usize {
        self.pipe_routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::SysIo;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn directory() -> ConnectionDirectory {
        ConnectionDirectory::new(Duration::from_secs(300), Duration::from_secs(10))
    }

    fn accepted(stream: UnixStream) -> Accepted {
        Accepted { fd: OwnedFd::from(stream), ip: Ipv4Addr::LOCALHOST, port: 4242 }
    }

    #[test]
    fn test_accept_registers_for_read() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let mut registry = Registry::with_capacity(4);
        let mut dir = directory();

        let fd = dir.accept(&mut registry, accepted(ours)).unwrap();
        let index = registry.index_of(fd).unwrap();
        assert_eq!(registry.category(index), Category::ClientSocket);
        assert_eq!(registry.interest(index), Interest::READABLE);

        let conn = dir.get(fd).unwrap();
        assert_eq!(conn.phase, Phase::Reading);
        assert_eq!(conn.peer_port(), 4242);
    }

    #[test]
    fn test_accept_at_capacity_tracks_nothing() {
        let (a, _pa) = UnixStream::pair().unwrap();
        let (b, _pb) = UnixStream::pair().unwrap();
        let mut registry = Registry::with_capacity(1);
        let mut dir = directory();

        dir.accept(&mut registry, accepted(a)).unwrap();
        let err = dir.accept(&mut registry, accepted(b)).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_cgi_routes() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let mut registry = Registry::with_capacity(4);
        let mut dir = directory();
        let client = dir.accept(&mut registry, accepted(ours)).unwrap();

        assert!(dir.bind_cgi(client, 77, 100, 101));
        assert_eq!(dir.get(client).unwrap().phase, Phase::AwaitingCgi);
        assert_eq!(dir.client_for_pipe(100), Some(client));
        assert_eq!(dir.client_for_pipe(101), Some(client));
        assert!(dir.is_response_pipe(100));
        assert!(!dir.is_response_pipe(101));

        assert_eq!(dir.unbind_pipe(101), Some(client));
        assert_eq!(dir.client_for_pipe(101), None);
        let link = dir.get(client).unwrap().cgi.as_ref().unwrap();
        assert_eq!(link.request_pipe, None);
        assert_eq!(link.response_pipe, Some(100));

        let conn = dir.release(client).unwrap();
        assert_eq!(conn.cgi.unwrap().open_pipes().collect::<Vec<_>>(), vec![100]);
        assert_eq!(dir.pipe_count(), 0);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_finalize_queues_response() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let mut registry = Registry::with_capacity(4);
        let mut buffers = BufferStore::new(SysIo, 1024, 4096);
        let mut dir = directory();
        let client = dir.accept(&mut registry, accepted(ours)).unwrap();

        dir.get_mut(client).unwrap().response = Response::ok("text/plain", b"hello".to_vec());
        let (status, size) = dir.finalize_and_close(client, &mut buffers).unwrap();
        assert_eq!(status, 200);
        assert_eq!(buffers.remaining(client), size);
        assert!(buffers.peek(client).ends_with(b"hello"));
        assert_eq!(dir.get(client).unwrap().phase, Phase::Responding);
    }

    #[test]
    fn test_finalize_overflow_becomes_500() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let mut registry = Registry::with_capacity(4);
        let mut buffers = BufferStore::new(SysIo, 512, 1024);
        let mut dir = directory();
        let client = dir.accept(&mut registry, accepted(ours)).unwrap();

        dir.get_mut(client).unwrap().response = Response::ok("text/plain", vec![b'x'; 4096]);
        let (status, size) = dir.finalize_and_close(client, &mut buffers).unwrap();
        assert_eq!(status, 500);
        assert_eq!(buffers.remaining(client), size);
        assert!(buffers.peek(client).starts_with(b"HTTP/1.1 500"));
    }

    #[test]
    fn test_assign_session() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let mut registry = Registry::with_capacity(4);
        let mut dir = directory();
        let client = dir.accept(&mut registry, accepted(ours)).unwrap();
        let now = Instant::now();

        let id = dir.assign_session(client, None, now).unwrap();
        let conn = dir.get(client).unwrap();
        assert_eq!(conn.session, Some(id));
        let cookie = format!("session={}; Path=/; HttpOnly", id);
        assert_eq!(conn.response.header("set-cookie"), Some(cookie.as_str()));

        // Presenting a live id reuses it without a new cookie.
        dir.get_mut(client).unwrap().response = Response::default();
        assert_eq!(dir.assign_session(client, Some(id), now), Some(id));
        assert!(dir.get(client).unwrap().response.header("set-cookie").is_none());
        assert_eq!(dir.sessions().len(), 1);
    }

    #[test]
    fn test_collect_garbage_on_interval() {
        let t0 = Instant::now();
        let mut dir = ConnectionDirectory::starting_at(Duration::from_secs(30), Duration::from_secs(10), t0);
        dir.sessions_mut().create(t0);

        assert_eq!(dir.collect_garbage(t0 + Duration::from_secs(5)), None);
        assert_eq!(dir.collect_garbage(t0 + Duration::from_secs(10)), Some(0));
        assert_eq!(dir.collect_garbage(t0 + Duration::from_secs(15)), None);
        assert_eq!(dir.collect_garbage(t0 + Duration::from_secs(31)), Some(1));
        assert!(dir.sessions().is_empty());
    }
}
