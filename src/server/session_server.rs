// src/server/session_server.rs

//! Defines `SessionServer`: the login pipeline, session bookkeeping and the
//! heartbeat sweep. The accept loop lives in `connection_loop`.

use super::guard::SessionGuard;
use super::handlers::{SessionContext, SessionHandler};
use super::listeners::ListenerRegistry;
use super::login::AcceptExtraCheck;
use super::session::{InMemorySessionStore, Session, SessionStore};
use crate::core::metrics;
use crate::core::{AnyStream, LinkSocket, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often the heartbeat sweep looks for stale sessions.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// `0` means unlimited.
    pub max_sessions: usize,
    /// `None` keeps idle sessions forever.
    pub heartbeat_timeout: Option<Duration>,
    /// First delay after a failed accept.
    pub accept_backoff: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            heartbeat_timeout: Some(Duration::from_secs(120)),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

pub struct SessionServer {
    transport: Transport,
    store: Arc<dyn SessionStore>,
    listeners: ListenerRegistry,
    extra_check: Arc<dyn AcceptExtraCheck>,
    handler: Arc<dyn SessionHandler>,
    pub(super) settings: ServerSettings,
}

impl SessionServer {
    pub fn new(
        transport: Transport,
        extra_check: Arc<dyn AcceptExtraCheck>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            transport,
            store: Arc::new(InMemorySessionStore::new()),
            listeners: ListenerRegistry::new(),
            extra_check,
            handler,
            settings: ServerSettings::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Runs one accepted stream through login and, on success, serves it as
    /// a session until it ends.
    pub async fn serve_connection(self: Arc<Self>, stream: AnyStream, peer: Option<SocketAddr>) {
        let mut socket = match peer {
            Some(addr) => LinkSocket::with_peer(stream, addr),
            None => LinkSocket::new(stream),
        };
        metrics::CONNECTIONS_ACCEPTED_TOTAL.inc();

        let max = self.settings.max_sessions;
        if max > 0 && self.store.len() >= max {
            warn!(
                "Refusing connection from {:?}: {} sessions already live.",
                peer, max
            );
            socket.close().await;
            return;
        }

        let meta = match self
            .extra_check
            .check(&self.transport, self.store.as_ref(), &mut socket)
            .await
        {
            Ok(meta) => meta,
            Err(e) => {
                metrics::LOGINS_REJECTED_TOTAL.inc();
                info!("Login from {:?} failed: {}", peer, e);
                socket.close().await;
                return;
            }
        };

        let session = Arc::new(Session::new(&socket, meta));
        let _guard = SessionGuard::new(self.store.clone(), session.clone());
        info!("Session {} opened for {:?}.", session.id(), peer);
        self.listeners.notify_connected(&session).await;

        let ctx = SessionContext {
            transport: &self.transport,
            listeners: &self.listeners,
        };
        if let Err(e) = self.handler.serve(ctx, &session, &mut socket).await {
            warn!("Session {} ended with an error: {}", session.id(), e);
        }
        socket.close().await;

        self.listeners.notify_disconnected(&session).await;
        info!("Session {} closed.", session.id());
    }

    /// Closes every session whose peer has been silent for longer than the
    /// heartbeat timeout. Returns how many were closed.
    pub fn sweep_heartbeats(&self) -> usize {
        let Some(timeout) = self.settings.heartbeat_timeout else {
            return 0;
        };
        let now = Instant::now();
        let mut closed = 0;
        for session in self.store.snapshot() {
            let idle = now.saturating_duration_since(session.last_heartbeat());
            if idle > timeout {
                info!(
                    "Session {} from {:?} idle for {:?}, closing.",
                    session.id(),
                    session.peer(),
                    idle
                );
                session.close();
                self.store.remove(session.id());
                closed += 1;
            }
        }
        closed
    }

    /// Force-closes every live session.
    pub fn close_all(&self) {
        for session in self.store.snapshot() {
            session.close();
        }
    }

    /// Sweeps stale sessions periodically until shutdown.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        if self.settings.heartbeat_timeout.is_none() {
            debug!("Heartbeat sweep disabled.");
            let _ = shutdown_rx.recv().await;
            return;
        }
        let mut interval = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let closed = self.sweep_heartbeats();
                    if closed > 0 {
                        debug!("Heartbeat sweep closed {} sessions.", closed);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Heartbeat sweep shutting down.");
                    return;
                }
            }
        }
    }
}
