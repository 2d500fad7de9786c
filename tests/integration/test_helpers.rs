// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use linkcore::core::{AnyStream, LinkSocket, ManagedSocket, TimeoutWatchdog, Transport};
use linkcore::server::SessionServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Installs a quiet test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A transport whose watchdog is already sweeping.
pub fn running_transport() -> Transport {
    init_tracing();
    let watchdog = TimeoutWatchdog::new();
    watchdog.start();
    Transport::new(watchdog)
}

/// Two connected in-memory sockets.
pub fn socket_pair() -> (LinkSocket, LinkSocket) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        ManagedSocket::new(AnyStream::boxed(a)),
        ManagedSocket::new(AnyStream::boxed(b)),
    )
}

/// A session server accepting on a loopback port.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub server: Arc<SessionServer>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub async fn start(server: SessionServer) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(server.clone().accept_loop(listener, shutdown_rx));
        Self {
            addr,
            server,
            shutdown_tx,
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Waits until the store holds `count` sessions.
    pub async fn wait_for_sessions(&self, count: usize) {
        for _ in 0..200 {
            if self.server.store().len() == count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} sessions, found {}",
            self.server.store().len()
        );
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.task.await.unwrap();
    }
}
