// src/server/session.rs

//! Server-side sessions and the store that tracks them.

use crate::core::{LinkSocket, SocketCloser};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;

/// What the login pipeline learned about a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMeta {
    /// Set by the DTU registration.
    pub device_id: Option<String>,
    /// Set by the account check.
    pub username: Option<String>,
}

/// One logged-in peer.
///
/// The socket itself stays with the task serving the session; the session
/// only holds its closer so sweeps and shutdown can end it from outside.
pub struct Session {
    id: u64,
    peer: Option<SocketAddr>,
    meta: SessionMeta,
    connected_at: SystemTime,
    last_heartbeat: Mutex<Instant>,
    closer: SocketCloser,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("meta", &self.meta)
            .field("closed", &self.closer.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(socket: &LinkSocket, meta: SessionMeta) -> Self {
        Self {
            id: socket.id(),
            peer: socket.peer(),
            meta,
            connected_at: SystemTime::now(),
            last_heartbeat: Mutex::new(Instant::now()),
            closer: socket.closer(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn device_id(&self) -> Option<&str> {
        self.meta.device_id.as_deref()
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Records activity from the peer.
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Force-closes the session's socket. The serving task notices on its
    /// next I/O.
    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

/// Where a server keeps its live sessions.
pub trait SessionStore: Send + Sync {
    fn insert(&self, session: Arc<Session>);

    fn remove(&self, id: u64) -> Option<Arc<Session>>;

    fn get(&self, id: u64) -> Option<Arc<Session>>;

    /// Finds the live session registered under `device_id`.
    fn find_by_device(&self, device_id: &str) -> Option<Arc<Session>>;

    /// A point-in-time copy, safe to iterate while sessions come and go.
    fn snapshot(&self) -> Vec<Arc<Session>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<u64, Arc<Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    fn find_by_device(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.device_id() == Some(device_id) && !entry.is_closed())
            .map(|entry| entry.value().clone())
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
