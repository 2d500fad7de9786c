// src/server/spawner.rs

//! Spawns the server's long-running background tasks.

use super::context::ServerContext;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) {
    let server = ctx.server.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        server.run_heartbeat(shutdown_rx).await;
        Ok(())
    });

    info!("All background tasks have been spawned.");
}
