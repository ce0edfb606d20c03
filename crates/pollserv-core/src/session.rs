//! Cookie sessions
//!
//! Sessions outlive connections: a client may reconnect and present the
//! same id. They are looked up by id, touched on every use, and evicted by
//! `expire` once idle for longer than the timeout. Callers pass the clock
//! in so expiry is deterministic under test.

use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Session identifier, rendered as 16 lowercase hex digits in cookies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(SessionId)
    }
}

/// One session
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    last_access: Instant,
    data: HashMap<String, String>,
}

impl Session {
    fn new(id: SessionId, now: Instant) -> Self {
        Self { id, last_access: now, data: HashMap::new() }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.data.remove(key)
    }

    /// Whether idle for longer than `timeout` at `now`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > timeout
    }
}

/// Id-keyed session store
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<SessionId, Session>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self { sessions: HashMap::new(), timeout }
    }

    /// Inactivity timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a session with a fresh random id
    pub fn create(&mut self, now: Instant) -> SessionId {
        let id = loop {
            let candidate = SessionId(rand::random::<u64>());
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        self.sessions.insert(id, Session::new(id, now));
        id
    }

    /// Look up a live session and refresh its last access.
    ///
    /// An expired session is evicted and not returned.
    pub fn touch(&mut self, id: SessionId, now: Instant) -> Option<&mut Session> {
        let expired = self.sessions.get(&id)?.is_expired(now, self.timeout);
        if expired {
            self.sessions.remove(&id);
            return None;
        }
        let session = self.sessions.get_mut(&id)?;
        session.last_access = now;
        Some(session)
    }

    /// Reuse `id` if it names a live session, otherwise create one.
    /// Returns the id in use and whether it is new.
    pub fn resolve(&mut self, id: Option<SessionId>, now: Instant) -> (SessionId, bool) {
        if let Some(id) = id {
            if self.touch(id, now).is_some() {
                return (id, false);
            }
        }
        (self.create(now), true)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Evict every session idle past the timeout. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        let timeout = self.timeout;
        self.sessions.retain(|_, s| !s.is_expired(now, timeout));
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
