// src/connection/handshake.rs

//! Signal exchanges some protocols need right after connecting and right
//! before closing.

use crate::core::errors::{LinkError, LinkResult, codes};
use crate::core::protocol::{HslPacket, SelfCheckProtocol};
use crate::core::protocol::hsl::{opcodes, pack_string_array};
use crate::core::{LinkSocket, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

#[async_trait]
pub trait HandshakeHook: Send + Sync {
    /// Runs on every fresh socket before it is used. A failure discards the socket.
    async fn initialize_on_connect(
        &self,
        _transport: &Transport,
        _socket: &mut LinkSocket,
    ) -> LinkResult<()> {
        Ok(())
    }

    /// Runs before a healthy socket is closed on purpose.
    async fn extra_on_disconnect(
        &self,
        _transport: &Transport,
        _socket: &mut LinkSocket,
    ) -> LinkResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandshake;

impl HandshakeHook for NoHandshake {}

/// Logs in with a username and password over the self-check envelope and
/// announces the close with an unacknowledged quit envelope.
#[derive(Debug, Clone)]
pub struct AccountHandshake {
    protocol: SelfCheckProtocol,
    username: String,
    password: String,
}

impl AccountHandshake {
    pub fn new(
        protocol: SelfCheckProtocol,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl HandshakeHook for AccountHandshake {
    async fn initialize_on_connect(
        &self,
        transport: &Transport,
        socket: &mut LinkSocket,
    ) -> LinkResult<()> {
        let credentials = pack_string_array(&[self.username.as_str(), self.password.as_str()])?;
        self.protocol
            .send_and_check(transport, socket, opcodes::ACCOUNT_LOGIN, 0, &credentials)
            .await?;

        let reply = self.protocol.receive_and_check(transport, socket).await?;
        match reply.opcode {
            opcodes::ACCOUNT_PASS_LOGIN => {
                debug!("Account {} logged in.", self.username);
                Ok(())
            }
            opcodes::ACCOUNT_REJECT_LOGIN => {
                let reason = reply
                    .content_string()
                    .unwrap_or_else(|_| "login rejected".to_string());
                warn!("Account {} was rejected: {}", self.username, reason);
                socket.close().await;
                Err(LinkError::Application {
                    code: codes::LOGIN_REJECTED,
                    message: reason,
                })
            }
            other => {
                socket.close().await;
                Err(LinkError::OpcodeMismatch {
                    expected: opcodes::ACCOUNT_PASS_LOGIN,
                    received: other,
                })
            }
        }
    }

    async fn extra_on_disconnect(
        &self,
        transport: &Transport,
        socket: &mut LinkSocket,
    ) -> LinkResult<()> {
        let quit = HslPacket::new(opcodes::CLIENT_QUIT, 0, self.protocol.token(), Bytes::new());
        transport.send(socket, &quit.encode()?).await.map(|_| ())
    }
}
