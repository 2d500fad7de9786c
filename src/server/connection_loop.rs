// src/server/connection_loop.rs

//! Contains the supervised accept loop and the top-level loop that handles
//! graceful shutdown.

use super::context::ServerContext;
use super::session_server::SessionServer;
use crate::core::AnyStream;
use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Upper bound for the accept backoff.
pub const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(5);
/// How long shutdown waits for sessions and background tasks to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Adds up to 50% random jitter so a crowd of failing listeners does not
/// retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 2) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

impl SessionServer {
    /// Accepts connections until `shutdown_rx` fires, then closes every
    /// session and waits for their tasks to finish.
    ///
    /// Accept errors never end the loop; they are logged and retried with an
    /// exponential backoff.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut sessions = JoinSet::new();
        let mut backoff = self.settings.accept_backoff;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Accept loop received the shutdown signal.");
                    break;
                }

                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        backoff = self.settings.accept_backoff;
                        debug!("Accepted new connection from: {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let server = self.clone();
                        sessions.spawn(server.serve_connection(AnyStream::from(stream), Some(addr)));
                    }
                    Err(e) => {
                        let delay = with_jitter(backoff);
                        warn!("Failed to accept connection: {}. Retrying in {:?}.", e, delay);
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                    }
                },

                Some(res) = sessions.join_next() => {
                    if let Err(e) = res
                        && e.is_panic()
                    {
                        error!("A session task panicked: {e:?}");
                    }
                }
            }
        }

        info!("Closing {} live sessions.", self.store().len());
        self.close_all();
        if tokio::time::timeout(DRAIN_TIMEOUT, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Timed out waiting for sessions to close, aborting them.");
            sessions.shutdown().await;
        }
    }
}

/// The main server loop: runs the accept loop until a signal or a failed
/// background task asks for shutdown.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let accept = ctx
        .server
        .clone()
        .accept_loop(ctx.listener, ctx.shutdown_tx.subscribe());
    tokio::pin!(accept);
    let mut accept_finished = false;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            _ = &mut accept => {
                warn!("Accept loop exited unexpectedly. Shutting down.");
                accept_finished = true;
                break;
            }
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    if !accept_finished {
        accept.await;
    }
    info!("All sessions closed.");

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
    Ok(())
}
