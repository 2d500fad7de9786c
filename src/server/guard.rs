// src/server/guard.rs

//! Defines `SessionGuard`, an RAII guard that keeps the session store and the
//! live-session gauge in step with the serving task.

use super::session::{Session, SessionStore};
use crate::core::metrics;
use std::sync::Arc;
use tracing::debug;

/// Registers a session on creation and always unregisters it on drop, even
/// when the serving task panics or is aborted.
pub(crate) struct SessionGuard {
    store: Arc<dyn SessionStore>,
    session: Arc<Session>,
}

impl SessionGuard {
    pub(crate) fn new(store: Arc<dyn SessionStore>, session: Arc<Session>) -> Self {
        store.insert(session.clone());
        metrics::LIVE_SESSIONS.inc();
        Self { store, session }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        metrics::LIVE_SESSIONS.dec();
        self.session.close();
        if self.store.remove(self.session.id()).is_none() {
            // The heartbeat sweep got there first.
            debug!("Session {} was already gone from the store.", self.session.id());
        }
        debug!(
            "Session {} from {:?} cleaned up.",
            self.session.id(),
            self.session.peer()
        );
    }
}
