// src/core/transport/socket.rs

//! Defines `ManagedSocket`, a stream paired with a closer that other tasks
//! (chiefly the watchdog) can trigger without owning the stream.

use super::stream::AnyStream;
use crate::core::errors::{LinkError, LinkResult};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// A non-owning handle that force-closes a [`ManagedSocket`].
///
/// Closing cancels every pending and future operation on the socket; the
/// owner drops the underlying stream the next time it touches it.
#[derive(Debug, Clone, Default)]
pub struct SocketCloser {
    token: CancellationToken,
}

impl SocketCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the socket has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// A socket exclusively owned by one connection or session.
pub struct ManagedSocket<S = AnyStream> {
    id: u64,
    stream: Option<S>,
    closer: SocketCloser,
    peer: Option<SocketAddr>,
}

/// The socket type used by connections and sessions.
pub type LinkSocket = ManagedSocket<AnyStream>;

impl<S> fmt::Debug for ManagedSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<S> ManagedSocket<S> {
    pub fn new(stream: S) -> Self {
        Self::from_parts(stream, SocketCloser::new(), None)
    }

    pub fn with_peer(stream: S, peer: SocketAddr) -> Self {
        Self::from_parts(stream, SocketCloser::new(), Some(peer))
    }

    /// Adopts a closer that was created before the stream existed, e.g. the one
    /// guarding a connect attempt.
    pub fn from_parts(stream: S, closer: SocketCloser, peer: Option<SocketAddr>) -> Self {
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            stream: Some(stream),
            closer,
            peer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn closer(&self) -> SocketCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none() || self.closer.is_closed()
    }

    /// Closes immediately without a graceful shutdown.
    pub fn abort(&mut self) {
        self.closer.close();
        self.stream = None;
    }

    /// Borrows the stream together with the closer so a caller can race I/O
    /// against a forced close. A socket closed by the watchdog is dropped here.
    pub(crate) fn parts(&mut self) -> LinkResult<(&mut S, &SocketCloser)> {
        if self.closer.is_closed() {
            self.stream = None;
        }
        match self.stream.as_mut() {
            Some(stream) => Ok((stream, &self.closer)),
            None => Err(LinkError::SocketClosed),
        }
    }

    pub fn into_inner(mut self) -> Option<S> {
        self.stream.take()
    }
}

impl<S: tokio::io::AsyncWrite + Unpin> ManagedSocket<S> {
    /// Shuts the write side down and releases the stream.
    pub async fn close(&mut self) {
        self.closer.close();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}
