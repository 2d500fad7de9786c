// src/server/login.rs

//! Pre-session checks run on every accepted socket. Only a peer that passes
//! becomes a session.

use super::session::{SessionMeta, SessionStore};
use crate::core::errors::{LinkError, LinkResult, codes};
use crate::core::protocol::alien::{LOGIN_PACKET_LENGTH, encode_status};
use crate::core::protocol::hsl::{opcodes, pack_string};
use crate::core::protocol::{AlienLoginPacket, LoginStatus, SelfCheckProtocol};
use crate::core::{LinkSocket, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait AcceptExtraCheck: Send + Sync {
    /// Authenticates the peer on `socket`. An error rejects it; the server
    /// closes the socket afterwards.
    async fn check(
        &self,
        transport: &Transport,
        sessions: &dyn SessionStore,
        socket: &mut LinkSocket,
    ) -> LinkResult<SessionMeta>;
}

/// Accepts every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtraCheck;

#[async_trait]
impl AcceptExtraCheck for NoExtraCheck {
    async fn check(
        &self,
        _transport: &Transport,
        _sessions: &dyn SessionStore,
        _socket: &mut LinkSocket,
    ) -> LinkResult<SessionMeta> {
        Ok(SessionMeta::default())
    }
}

/// The server half of the account handshake.
#[derive(Debug, Clone)]
pub struct AccountCheck {
    protocol: SelfCheckProtocol,
    accounts: HashMap<String, String>,
}

impl AccountCheck {
    /// With no accounts configured every peer is let through unchallenged.
    pub fn new(protocol: SelfCheckProtocol, accounts: HashMap<String, String>) -> Self {
        Self { protocol, accounts }
    }

    fn verify(&self, credentials: &[String]) -> bool {
        match credentials {
            [username, password, ..] => self.accounts.get(username) == Some(password),
            _ => false,
        }
    }
}

#[async_trait]
impl AcceptExtraCheck for AccountCheck {
    async fn check(
        &self,
        transport: &Transport,
        _sessions: &dyn SessionStore,
        socket: &mut LinkSocket,
    ) -> LinkResult<SessionMeta> {
        if self.accounts.is_empty() {
            return Ok(SessionMeta::default());
        }

        let login = self
            .protocol
            .receive_expecting(transport, socket, opcodes::ACCOUNT_LOGIN)
            .await?;
        let credentials = login.content_string_array()?;

        if self.verify(&credentials) {
            self.protocol
                .send_and_check(
                    transport,
                    socket,
                    opcodes::ACCOUNT_PASS_LOGIN,
                    0,
                    &pack_string("success"),
                )
                .await?;
            let username = credentials.into_iter().next();
            debug!("Account {:?} logged in.", username);
            return Ok(SessionMeta {
                device_id: None,
                username,
            });
        }

        let reason = "user name or password is wrong";
        warn!(
            "Rejecting account login for {:?} from {:?}.",
            credentials.first(),
            socket.peer()
        );
        self.protocol
            .send_and_check(
                transport,
                socket,
                opcodes::ACCOUNT_REJECT_LOGIN,
                0,
                &pack_string(reason),
            )
            .await?;
        Err(LinkError::Application {
            code: codes::LOGIN_REJECTED,
            message: reason.to_string(),
        })
    }
}

/// DTU registration: reads the fixed login packet, answers with a status and
/// keeps the socket only on success.
#[derive(Debug, Clone, Default)]
pub struct AlienLogin {
    password: String,
    forbidden: HashSet<String>,
    login_timeout: Option<Duration>,
}

impl AlienLogin {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_forbidden<I, T>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.forbidden = devices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_login_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Decides the status for a parsed packet. Checks run forbidden first,
    /// then password, then duplicate.
    pub fn status_for(&self, packet: &AlienLoginPacket, sessions: &dyn SessionStore) -> LoginStatus {
        if self.forbidden.contains(&packet.device_id) {
            LoginStatus::Forbidden
        } else if !self.password.is_empty() && packet.password != self.password {
            LoginStatus::BadPassword
        } else if sessions.find_by_device(&packet.device_id).is_some() {
            LoginStatus::DuplicateLogin
        } else {
            LoginStatus::Success
        }
    }
}

#[async_trait]
impl AcceptExtraCheck for AlienLogin {
    async fn check(
        &self,
        transport: &Transport,
        sessions: &dyn SessionStore,
        socket: &mut LinkSocket,
    ) -> LinkResult<SessionMeta> {
        let raw = transport
            .receive_exact(socket, LOGIN_PACKET_LENGTH, self.login_timeout)
            .await?;
        let packet = match AlienLoginPacket::parse(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                socket.close().await;
                return Err(e);
            }
        };

        let status = self.status_for(&packet, sessions);
        transport.send(socket, &encode_status(status)).await?;
        if status != LoginStatus::Success {
            info!(
                "DTU {} from {:?} refused: {}.",
                packet.device_id,
                socket.peer(),
                status
            );
            socket.close().await;
            return Err(LinkError::Login(status));
        }

        info!("DTU {} registered from {:?}.", packet.device_id, socket.peer());
        Ok(SessionMeta {
            device_id: Some(packet.device_id),
            username: None,
        })
    }
}
