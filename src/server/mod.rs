// src/server/mod.rs

//! The session server: login pipeline, session tracking, heartbeat sweep and
//! a supervised accept loop.

use crate::config::Config;
use crate::core::metrics;
use anyhow::Result;
use tracing::debug;

mod connection_loop;
mod context;
mod guard;
mod handlers;
mod initialization;
mod listeners;
mod login;
mod session;
mod session_server;
mod spawner;

pub use connection_loop::MAX_ACCEPT_BACKOFF;
pub use handlers::{AlienDataHandler, HslEchoHandler, SessionContext, SessionHandler};
pub use initialization::build_server;
pub use listeners::{ListenerRegistry, SessionListener};
pub use login::{AcceptExtraCheck, AccountCheck, AlienLogin, NoExtraCheck};
pub use session::{InMemorySessionStore, Session, SessionMeta, SessionStore};
pub use session_server::{HEARTBEAT_CHECK_INTERVAL, ServerSettings, SessionServer};

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Build the server and bind the listener.
    let mut server_context = initialization::setup(config).await?;
    let watchdog = server_context.server.transport().watchdog().clone();

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context);

    // 3. Accept connections until shutdown.
    let result = connection_loop::run(server_context).await;

    watchdog.stop().await;
    debug!("Final metrics:\n{}", metrics::gather_metrics());
    result
}
