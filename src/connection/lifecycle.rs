// src/connection/lifecycle.rs

//! Defines `Connection`, which decides per operation whether to reuse a
//! persistent socket or open an ephemeral one, and serializes request/response
//! exchanges on it.

use super::connector::{Connector, TcpConnector};
use super::frame_transport::{FrameTransport, HslTransport};
use super::guard::ExchangeGuard;
use super::handshake::{AccountHandshake, HandshakeHook, NoHandshake};
use super::options::ConnectionOptions;
use crate::config::ClientConfig;
use crate::core::errors::{LinkError, LinkResult};
use crate::core::metrics;
use crate::core::protocol::{HslPacket, SelfCheckProtocol};
use crate::core::protocol::hsl::{opcodes, pack_string};
use crate::core::transport::MessageDescriptor;
use crate::core::{LinkSocket, ManagedSocket, SocketCloser, Transport};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A connect failure faster than this on the first attempt is retried once
/// immediately; the peer was most likely just reset.
pub const FAST_FAILURE_WINDOW: Duration = Duration::from_millis(500);

/// One logical connection to a remote endpoint.
pub struct Connection<P: FrameTransport> {
    id: String,
    endpoint: String,
    options: ConnectionOptions,
    protocol: P,
    handshake: Arc<dyn HandshakeHook>,
    connector: Arc<dyn Connector>,
    transport: Transport,
    persistent: AtomicBool,
    in_error: AtomicBool,
    /// The interactive lock. It also holds the persistent socket between
    /// exchanges.
    socket: Mutex<Option<LinkSocket>>,
}

impl<P: FrameTransport> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("persistent", &self.is_persistent())
            .field("in_error", &self.is_in_error())
            .finish()
    }
}

impl<P: FrameTransport> Connection<P> {
    pub fn new(endpoint: impl Into<String>, protocol: P, transport: Transport) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            options: ConnectionOptions::default(),
            protocol,
            handshake: Arc::new(NoHandshake),
            connector: Arc::new(TcpConnector),
            transport,
            persistent: AtomicBool::new(false),
            in_error: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.persistent = AtomicBool::new(options.persistent);
        self.options = options;
        self
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn HandshakeHook>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    /// Switches to persistent mode without connecting; the first operation
    /// connects lazily.
    pub fn set_persistent_connection(&self) {
        self.persistent.store(true, Ordering::Release);
    }

    /// Replaces any existing socket with a fresh, initialized one and enters
    /// persistent mode.
    pub async fn connect_server(&self) -> LinkResult<()> {
        let mut slot = self.socket.lock().await;
        if let Some(mut stale) = slot.take() {
            debug!("Connection {} dropping its previous socket.", self.id);
            stale.close().await;
        }
        self.persistent.store(true, Ordering::Release);
        match self.open_socket().await {
            Ok(socket) => {
                *slot = Some(socket);
                self.in_error.store(false, Ordering::Release);
                info!("Connection {} connected to {}.", self.id, self.endpoint);
                Ok(())
            }
            Err(e) => {
                self.in_error.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Leaves persistent mode and closes the socket, running the disconnect
    /// hook first when the socket is healthy.
    pub async fn connect_close(&self) -> LinkResult<()> {
        let mut slot = self.socket.lock().await;
        self.persistent.store(false, Ordering::Release);
        let mut result = Ok(());
        if let Some(mut socket) = slot.take() {
            if !socket.is_closed() && !self.is_in_error() {
                result = self
                    .handshake
                    .extra_on_disconnect(&self.transport, &mut socket)
                    .await;
            }
            socket.close().await;
            info!("Connection {} closed.", self.id);
        }
        self.in_error.store(false, Ordering::Release);
        result
    }

    /// Sends `command` and, when a receive timeout is configured, returns the
    /// unpacked response.
    pub async fn read_from_core_server(&self, command: &[u8]) -> LinkResult<Vec<u8>> {
        let has_response = self.options.receive_timeout.is_some();
        self.read_from_core_server_with(command, has_response).await
    }

    /// The end-to-end exchange used by every protocol call.
    pub async fn read_from_core_server_with(
        &self,
        command: &[u8],
        has_response: bool,
    ) -> LinkResult<Vec<u8>> {
        self.exchange_and_accept(command, has_response, Ok).await
    }

    /// Runs one exchange and hands the response to `accept` while the socket
    /// is still held. A rejected response invalidates the socket like any
    /// other failure.
    async fn exchange_and_accept<T, F>(
        &self,
        command: &[u8],
        has_response: bool,
        accept: F,
    ) -> LinkResult<T>
    where
        F: FnOnce(Vec<u8>) -> LinkResult<T>,
    {
        let mut slot = self.socket.lock().await;
        let mut socket = self.get_available_socket(&mut slot).await?;

        let guard = ExchangeGuard::new(&self.in_error, &self.id);
        let result = self
            .exchange(&mut socket, command, has_response)
            .await
            .and_then(accept);
        guard.complete(result.is_ok());

        match &result {
            Ok(_) if self.is_persistent() => *slot = Some(socket),
            Ok(_) => self.release_ephemeral(socket).await,
            Err(e) => {
                warn!(
                    "Exchange on connection {} failed: {}. The next call reconnects.",
                    self.id, e
                );
                socket.abort();
            }
        }
        result
    }

    async fn exchange(
        &self,
        socket: &mut LinkSocket,
        command: &[u8],
        has_response: bool,
    ) -> LinkResult<Vec<u8>> {
        let packed = self.protocol.pack_command(command)?;
        let mut descriptor = self.protocol.new_descriptor();
        descriptor.set_sent_bytes(&packed);

        self.transport.send(socket, &packed).await?;
        if !has_response {
            return Ok(Vec::new());
        }

        let frame = self
            .transport
            .receive_by_message(socket, self.options.receive_timeout, &descriptor, None)
            .await?;
        descriptor.check_header(&frame)?;
        self.protocol.unpack_response(&packed, &frame)
    }

    /// Hands out a usable socket. A persistent connection reuses its socket
    /// unless it is missing or in error; an ephemeral one always connects fresh.
    async fn get_available_socket(&self, slot: &mut Option<LinkSocket>) -> LinkResult<LinkSocket> {
        if !self.is_persistent() {
            return self.open_socket().await;
        }

        match slot.take() {
            Some(socket) if !self.is_in_error() && !socket.is_closed() => Ok(socket),
            stale => {
                if let Some(mut socket) = stale {
                    socket.abort();
                }
                match self.open_socket().await {
                    Ok(socket) => {
                        self.in_error.store(false, Ordering::Release);
                        Ok(socket)
                    }
                    Err(e) => {
                        self.in_error.store(true, Ordering::Release);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn release_ephemeral(&self, mut socket: LinkSocket) {
        if let Err(e) = self
            .handshake
            .extra_on_disconnect(&self.transport, &mut socket)
            .await
        {
            debug!("Disconnect hook on connection {} failed: {}", self.id, e);
        }
        socket.close().await;
    }

    /// Connects (with the fast-failure retry) and runs the connect hook.
    async fn open_socket(&self) -> LinkResult<LinkSocket> {
        let started = Instant::now();
        let mut socket = match self.connect_once().await {
            Ok(socket) => socket,
            Err(e) if retry_immediately(&e, started.elapsed()) => {
                info!(
                    "Connect to {} failed fast ({}), retrying once.",
                    self.endpoint, e
                );
                metrics::RECONNECT_RETRIES_TOTAL.inc();
                self.connect_once().await?
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", self.endpoint, e);
                return Err(e);
            }
        };

        if let Err(e) = self
            .handshake
            .initialize_on_connect(&self.transport, &mut socket)
            .await
        {
            warn!("Connect hook on {} failed: {}", self.endpoint, e);
            socket.abort();
            return Err(e);
        }
        self.transport.error_counter().reset();
        Ok(socket)
    }

    /// One connect attempt guarded by a watchdog entry.
    async fn connect_once(&self) -> LinkResult<LinkSocket> {
        let closer = SocketCloser::new();
        let timeout = self.options.connect_timeout;
        let guard = self
            .transport
            .watchdog()
            .register(closer.clone(), Some(timeout));

        let result = tokio::select! {
            biased;
            _ = closer.closed() => None,
            result = self.connector.connect(&self.endpoint) => Some(result),
        };
        guard.succeed();

        match result {
            Some(Ok((stream, peer))) if !guard.is_timed_out() => {
                Ok(ManagedSocket::from_parts(stream, closer, peer))
            }
            Some(Err(e)) if !guard.is_timed_out() => Err(self
                .transport
                .connection_failure(format!("connect to {} failed: {e}", self.endpoint))),
            _ => {
                metrics::SOCKET_ERRORS_TOTAL.inc();
                Err(LinkError::ConnectTimeout {
                    endpoint: self.endpoint.clone(),
                    code: -self.transport.error_counter().increment(),
                    timeout,
                })
            }
        }
    }
}

fn retry_immediately(error: &LinkError, elapsed: Duration) -> bool {
    !matches!(error, LinkError::ConnectTimeout { .. }) && elapsed < FAST_FAILURE_WINDOW
}

impl Connection<HslTransport> {
    /// Applies the client section of the config: timeouts, persistence and,
    /// when a username is set, the account login on every fresh socket.
    pub fn with_client_config(self, config: &ClientConfig) -> Self {
        let options = ConnectionOptions::from(config);
        let receive_timeout = options.receive_timeout;
        let connection = self.with_options(options);
        if config.username.is_empty() {
            return connection;
        }
        let protocol =
            SelfCheckProtocol::new(connection.protocol.token()).with_receive_timeout(receive_timeout);
        let handshake = AccountHandshake::new(protocol, &config.username, &config.password);
        connection.with_handshake(Arc::new(handshake))
    }

    /// Sends one envelope and returns the peer's reply envelope.
    pub async fn self_check_request(
        &self,
        opcode: i32,
        user_code: i32,
        content: impl Into<Bytes>,
    ) -> LinkResult<HslPacket> {
        self.self_check_exchange(opcode, user_code, content, Ok).await
    }

    /// Sends a string under `user_code` and expects a string back.
    pub async fn read_string(&self, user_code: i32, value: &str) -> LinkResult<String> {
        self.self_check_exchange(opcodes::USER_STRING, user_code, pack_string(value), |reply| {
            expect_opcode(&reply, opcodes::USER_STRING)?;
            reply.content_string()
        })
        .await
    }

    pub async fn read_bytes(&self, user_code: i32, content: &[u8]) -> LinkResult<Bytes> {
        self.self_check_exchange(
            opcodes::USER_BYTES,
            user_code,
            Bytes::copy_from_slice(content),
            |reply| {
                expect_opcode(&reply, opcodes::USER_BYTES)?;
                Ok(reply.content)
            },
        )
        .await
    }

    async fn self_check_exchange<T, F>(
        &self,
        opcode: i32,
        user_code: i32,
        content: impl Into<Bytes>,
        accept: F,
    ) -> LinkResult<T>
    where
        F: FnOnce(HslPacket) -> LinkResult<T>,
    {
        let token = self.protocol.token();
        let request = HslPacket::new(opcode, user_code, token, content).encode()?;
        let has_response = self.options.receive_timeout.is_some();
        self.exchange_and_accept(&request, has_response, |reply| {
            if reply.is_empty() {
                // No response was expected.
                return accept(HslPacket::new(opcode, user_code, token, Bytes::new()));
            }
            accept(HslPacket::decode(&reply)?)
        })
        .await
    }
}

fn expect_opcode(reply: &HslPacket, expected: i32) -> LinkResult<()> {
    if reply.opcode != expected {
        return Err(LinkError::OpcodeMismatch {
            expected,
            received: reply.opcode,
        });
    }
    Ok(())
}
