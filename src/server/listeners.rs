// src/server/listeners.rs

//! Session notifications. Listeners are called one after another in the order
//! they were registered; a slow listener delays the ones after it.

use super::session::Session;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

#[async_trait]
pub trait SessionListener: Send + Sync {
    /// A peer passed the login pipeline.
    async fn on_connected(&self, _session: &Session) {}

    /// The peer sent application data.
    async fn on_message(&self, _session: &Session, _payload: &[u8]) {}

    /// The session ended, for whatever reason.
    async fn on_disconnected(&self, _session: &Session) {}
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    // The lock is never held across an await.
    fn snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.read().clone()
    }

    pub async fn notify_connected(&self, session: &Session) {
        for listener in self.snapshot() {
            listener.on_connected(session).await;
        }
    }

    pub async fn notify_message(&self, session: &Session, payload: &[u8]) {
        for listener in self.snapshot() {
            listener.on_message(session, payload).await;
        }
    }

    pub async fn notify_disconnected(&self, session: &Session) {
        for listener in self.snapshot() {
            listener.on_disconnected(session).await;
        }
    }
}
