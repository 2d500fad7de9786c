// src/server/initialization.rs

//! Builds the session server described by the configuration and binds its
//! listener.

use super::context::ServerContext;
use super::handlers::{AlienDataHandler, HslEchoHandler};
use super::login::{AccountCheck, AlienLogin};
use super::session_server::{ServerSettings, SessionServer};
use crate::config::{Config, ServerMode};
use crate::core::protocol::SelfCheckProtocol;
use crate::core::{TimeoutWatchdog, Transport};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let watchdog = TimeoutWatchdog::new();
    watchdog.start();

    let server = Arc::new(build_server(&config, Transport::new(watchdog)));

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("linkcore server listening on {}:{}", config.host, config.port);

    Ok(ServerContext {
        server,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Assembles the login pipeline and handler for the configured mode.
pub fn build_server(config: &Config, transport: Transport) -> SessionServer {
    let settings = ServerSettings {
        max_sessions: config.max_sessions,
        heartbeat_timeout: match config.server.heartbeat_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        accept_backoff: Duration::from_millis(config.server.accept_backoff_ms.max(1)),
    };
    let login_timeout = Some(Duration::from_millis(config.client.connect_timeout_ms));

    let server = match config.server.mode {
        ServerMode::Hsl => {
            let protocol =
                SelfCheckProtocol::new(config.server.token).with_receive_timeout(login_timeout);
            SessionServer::new(
                transport,
                Arc::new(AccountCheck::new(protocol, config.server.accounts.clone())),
                Arc::new(HslEchoHandler::new(config.server.token)),
            )
        }
        ServerMode::Alien => {
            let login = AlienLogin::new(config.alien.password.clone())
                .with_forbidden(config.alien.forbidden.iter().cloned())
                .with_login_timeout(login_timeout);
            SessionServer::new(transport, Arc::new(login), Arc::new(AlienDataHandler))
        }
    };
    server.with_settings(settings)
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    match config.server.mode {
        ServerMode::Hsl => info!(
            "Server starting in HSL mode with {} configured accounts.",
            config.server.accounts.len()
        ),
        ServerMode::Alien => info!(
            "Server starting in ALIEN mode with {} forbidden devices.",
            config.alien.forbidden.len()
        ),
    }
    if config.server.mode == ServerMode::Hsl && config.server.token.is_nil() {
        warn!("WARNING: server.token is the nil UUID. Any peer that knows the protocol can connect.");
    }
    if config.max_sessions == 0 {
        warn!("WARNING: No 'max_sessions' limit is active.");
    } else {
        info!("Session limit set to {}.", config.max_sessions);
    }
}
