// src/server/handlers.rs

//! What a server does with a session once it has logged in.

use super::listeners::ListenerRegistry;
use super::session::Session;
use crate::core::errors::{LinkError, LinkResult};
use crate::core::protocol::hsl::opcodes;
use crate::core::protocol::{HslMessage, HslPacket};
use crate::core::transport::MessageDescriptor;
use crate::core::{LinkSocket, Transport};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// Shared server facilities handed to a handler.
#[derive(Clone, Copy)]
pub struct SessionContext<'a> {
    pub transport: &'a Transport,
    pub listeners: &'a ListenerRegistry,
}

#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Serves the session until the peer leaves or the socket is closed from
    /// outside. Returning ends the session.
    async fn serve(
        &self,
        ctx: SessionContext<'_>,
        session: &Session,
        socket: &mut LinkSocket,
    ) -> LinkResult<()>;
}

/// An orderly end: the peer hung up or someone closed the socket on purpose.
fn is_session_end(error: &LinkError) -> bool {
    error.is_remote_closed() || matches!(error, LinkError::SocketClosed)
}

/// Echoes every envelope back to its sender. Heartbeats refresh the session;
/// a quit envelope ends it; everything else is also passed to listeners.
#[derive(Debug, Clone, Copy)]
pub struct HslEchoHandler {
    token: Uuid,
}

impl HslEchoHandler {
    pub fn new(token: Uuid) -> Self {
        Self { token }
    }
}

#[async_trait]
impl SessionHandler for HslEchoHandler {
    async fn serve(
        &self,
        ctx: SessionContext<'_>,
        session: &Session,
        socket: &mut LinkSocket,
    ) -> LinkResult<()> {
        let descriptor = HslMessage::with_token(self.token);
        loop {
            let frame = match ctx
                .transport
                .receive_by_message(socket, None, &descriptor, None)
                .await
            {
                Ok(frame) => frame,
                Err(e) if is_session_end(&e) => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Err(e) = descriptor.check_header(&frame) {
                socket.close().await;
                return Err(e);
            }
            let packet = HslPacket::decode(&frame)?;
            session.touch();

            match packet.opcode {
                opcodes::CLIENT_QUIT => {
                    debug!("Session {} sent quit.", session.id());
                    return Ok(());
                }
                opcodes::CHECK_SECONDS => {}
                _ => ctx.listeners.notify_message(session, &packet.content).await,
            }
            ctx.transport.send(socket, &frame).await?;
        }
    }
}

/// Reads whatever a registered DTU sends and hands it to listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlienDataHandler;

#[async_trait]
impl SessionHandler for AlienDataHandler {
    async fn serve(
        &self,
        ctx: SessionContext<'_>,
        session: &Session,
        socket: &mut LinkSocket,
    ) -> LinkResult<()> {
        loop {
            match ctx.transport.receive_available(socket, None).await {
                Ok(data) => {
                    session.touch();
                    ctx.listeners.notify_message(session, &data).await;
                }
                Err(e) if is_session_end(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
