// src/core/protocol/hsl.rs

//! The self-check envelope ("HSL" protocol).
//!
//! Wire layout, all integers little-endian:
//!
//! ```text
//! [i32 opcode][i32 user code][16-byte token][i32 content length][content]
//! ```
//!
//! The receiving side acknowledges every envelope with an `i64` echo of the
//! total number of bytes it received. The echo is a byte count only, not a
//! checksum of the content.

use crate::core::errors::{LinkError, LinkResult};
use crate::core::transport::{ManagedSocket, MessageDescriptor, Transport};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use uuid::Uuid;

pub const HEADER_LENGTH: usize = 28;
pub const ACK_LENGTH: usize = 8;
const TOKEN_OFFSET: usize = 8;
const LENGTH_OFFSET: usize = 24;

/// Well-known opcodes.
pub mod opcodes {
    pub const CHECK_SECONDS: i32 = 1;
    pub const CLIENT_QUIT: i32 = 2;
    pub const CLIENT_REFUSE_LOGIN: i32 = 3;
    pub const CLIENT_ALLOW_LOGIN: i32 = 4;
    pub const ACCOUNT_LOGIN: i32 = 5;
    pub const ACCOUNT_REJECT_LOGIN: i32 = 6;
    pub const ACCOUNT_PASS_LOGIN: i32 = 7;
    pub const USER_STRING: i32 = 1001;
    pub const USER_BYTES: i32 = 1002;
    pub const USER_BITMAP: i32 = 1003;
    pub const USER_EXCEPTION: i32 = 1004;
    pub const USER_STRING_ARRAY: i32 = 1005;
    pub const FILE_DOWNLOAD: i32 = 2001;
    pub const FILE_UPLOAD: i32 = 2002;
    pub const FILE_DELETE: i32 = 2003;
    pub const FILE_CHECK_RIGHT: i32 = 2004;
    pub const FILE_CHECK_ERROR: i32 = 2005;
    pub const FILE_SAVE_ERROR: i32 = 2006;
    pub const FILE_DIRECTORY_FILES: i32 = 2007;
    pub const FILE_DIRECTORIES: i32 = 2008;
    pub const PROGRESS_REPORT: i32 = 2009;
}

/// One decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HslPacket {
    pub opcode: i32,
    pub user_code: i32,
    pub token: Uuid,
    pub content: Bytes,
}

impl HslPacket {
    pub fn new(opcode: i32, user_code: i32, token: Uuid, content: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            user_code,
            token,
            content: content.into(),
        }
    }

    /// Serializes the envelope.
    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        let length = wire_length(self.content.len(), "envelope content bytes")?;
        let mut wire = Vec::with_capacity(HEADER_LENGTH + self.content.len());
        wire.extend_from_slice(&self.opcode.to_le_bytes());
        wire.extend_from_slice(&self.user_code.to_le_bytes());
        wire.extend_from_slice(&self.token.to_bytes_le());
        wire.extend_from_slice(&length.to_le_bytes());
        wire.extend_from_slice(&self.content);
        Ok(wire)
    }

    /// Parses a complete envelope (header plus content).
    pub fn decode(frame: &[u8]) -> LinkResult<Self> {
        if frame.len() < HEADER_LENGTH {
            return Err(LinkError::IncompleteData);
        }
        let length = content_length(frame);
        if length < 0 || frame.len() - HEADER_LENGTH != length as usize {
            return Err(LinkError::Protocol(format!(
                "envelope declares {length} content bytes but carries {}",
                frame.len() - HEADER_LENGTH
            )));
        }
        Ok(Self {
            opcode: read_i32(frame, 0),
            user_code: read_i32(frame, 4),
            token: read_token(frame),
            content: Bytes::copy_from_slice(&frame[HEADER_LENGTH..]),
        })
    }

    /// Interprets the content as a UTF-16LE string.
    pub fn content_string(&self) -> LinkResult<String> {
        unpack_string(&self.content)
    }

    pub fn content_string_array(&self) -> LinkResult<Vec<String>> {
        unpack_string_array(&self.content)
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_token(header: &[u8]) -> Uuid {
    let mut token = [0u8; 16];
    token.copy_from_slice(&header[TOKEN_OFFSET..TOKEN_OFFSET + 16]);
    Uuid::from_bytes_le(token)
}

fn content_length(header: &[u8]) -> i32 {
    read_i32(header, LENGTH_OFFSET)
}

/// Encodes a string as UTF-16LE.
pub fn pack_string(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn unpack_string(bytes: &[u8]) -> LinkResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(LinkError::Protocol(
            "utf-16 payload has an odd number of bytes".to_string(),
        ));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16(&units)?)
}

/// Packs strings as `[i32 count]` followed by `[i32 byte length][UTF-16LE]`
/// per item.
pub fn pack_string_array<T: AsRef<str>>(values: &[T]) -> LinkResult<Vec<u8>> {
    let mut packed = Vec::new();
    packed.extend_from_slice(&wire_length(values.len(), "string array items")?.to_le_bytes());
    for value in values {
        let encoded = pack_string(value.as_ref());
        let length = wire_length(encoded.len(), "string array item bytes")?;
        packed.extend_from_slice(&length.to_le_bytes());
        packed.extend_from_slice(&encoded);
    }
    Ok(packed)
}

/// Narrows a length to the `i32` the wire carries.
fn wire_length(len: usize, what: &str) -> LinkResult<i32> {
    i32::try_from(len)
        .map_err(|_| LinkError::InvalidArgument(format!("{len} {what} exceed the i32 wire limit")))
}

pub fn unpack_string_array(bytes: &[u8]) -> LinkResult<Vec<String>> {
    let truncated = || LinkError::Protocol("truncated string array".to_string());
    if bytes.len() < 4 {
        return Err(truncated());
    }
    let count = read_i32(bytes, 0);
    if count < 0 {
        return Err(LinkError::Protocol(format!(
            "negative string array count {count}"
        )));
    }
    let mut offset = 4;
    // Every item needs at least its 4-byte length prefix.
    let mut values = Vec::with_capacity((count as usize).min(bytes.len() / 4));
    for _ in 0..count {
        if bytes.len() < offset + 4 {
            return Err(truncated());
        }
        let length = read_i32(bytes, offset);
        offset += 4;
        if length < 0 || bytes.len() < offset + length as usize {
            return Err(truncated());
        }
        values.push(unpack_string(&bytes[offset..offset + length as usize])?);
        offset += length as usize;
    }
    Ok(values)
}

/// Framing descriptor for envelopes. When a token is set, received headers
/// must carry it.
#[derive(Debug, Clone, Default)]
pub struct HslMessage {
    token: Option<Uuid>,
    sent: Option<Vec<u8>>,
}

impl HslMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Uuid) -> Self {
        Self {
            token: Some(token),
            sent: None,
        }
    }
}

impl MessageDescriptor for HslMessage {
    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn content_length(&self, header: &[u8]) -> i64 {
        content_length(header) as i64
    }

    fn check_header(&self, frame: &[u8]) -> LinkResult<()> {
        if frame.len() < HEADER_LENGTH {
            return Err(LinkError::IncompleteData);
        }
        match self.token {
            Some(token) if read_token(frame) != token => Err(LinkError::TokenMismatch),
            _ => Ok(()),
        }
    }

    fn set_sent_bytes(&mut self, sent: &[u8]) {
        self.sent = Some(sent.to_vec());
    }

    fn sent_bytes(&self) -> Option<&[u8]> {
        self.sent.as_deref()
    }
}

/// The token-guarded, length-acknowledged exchange used by simplified
/// request/response clients, the account handshake and the echo server.
#[derive(Debug, Clone)]
pub struct SelfCheckProtocol {
    token: Uuid,
    receive_timeout: Option<Duration>,
}

impl SelfCheckProtocol {
    pub fn new(token: Uuid) -> Self {
        Self {
            token,
            receive_timeout: None,
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Sends one envelope and waits for the peer to acknowledge the exact
    /// number of bytes sent.
    pub async fn send_and_check<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        opcode: i32,
        user_code: i32,
        content: &[u8],
    ) -> LinkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let wire =
            HslPacket::new(opcode, user_code, self.token, Bytes::copy_from_slice(content)).encode()?;
        transport.send(socket, &wire).await?;

        let ack = transport
            .receive_exact(socket, ACK_LENGTH, self.receive_timeout)
            .await?;
        let acknowledged = i64::from_le_bytes(ack_bytes(&ack));
        if acknowledged != wire.len() as i64 {
            warn!(
                "Peer acknowledged {} bytes for a {} byte envelope, closing.",
                acknowledged,
                wire.len()
            );
            socket.close().await;
            return Err(LinkError::LengthMismatch {
                sent: wire.len() as i64,
                acknowledged,
            });
        }
        Ok(())
    }

    /// Receives one envelope, checks its token and acknowledges its length.
    pub async fn receive_and_check<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
    ) -> LinkResult<HslPacket>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = transport
            .receive_exact(socket, HEADER_LENGTH, self.receive_timeout)
            .await?;
        if read_token(&header) != self.token {
            warn!("Envelope token did not match, closing the socket.");
            socket.close().await;
            return Err(LinkError::TokenMismatch);
        }

        let length = content_length(&header);
        if length < 0 || length as usize > crate::core::transport::MAX_MESSAGE_CONTENT {
            socket.close().await;
            return Err(LinkError::Protocol(format!(
                "invalid envelope content length {length}"
            )));
        }
        let content = transport
            .receive_exact(socket, length as usize, self.receive_timeout)
            .await?;

        let total = (HEADER_LENGTH + content.len()) as i64;
        transport.send(socket, &total.to_le_bytes()).await?;
        debug!(
            "Received envelope opcode {} with {} content bytes.",
            read_i32(&header, 0),
            content.len()
        );

        Ok(HslPacket {
            opcode: read_i32(&header, 0),
            user_code: read_i32(&header, 4),
            token: self.token,
            content: Bytes::from(content),
        })
    }

    /// Receives one envelope and requires `opcode` on it.
    pub async fn receive_expecting<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        opcode: i32,
    ) -> LinkResult<HslPacket>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = self.receive_and_check(transport, socket).await?;
        if packet.opcode != opcode {
            socket.close().await;
            return Err(LinkError::OpcodeMismatch {
                expected: opcode,
                received: packet.opcode,
            });
        }
        Ok(packet)
    }

    pub async fn send_string<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        user_code: i32,
        value: &str,
    ) -> LinkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_and_check(
            transport,
            socket,
            opcodes::USER_STRING,
            user_code,
            &pack_string(value),
        )
        .await
    }

    pub async fn send_string_array<S, T>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        user_code: i32,
        values: &[T],
    ) -> LinkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        T: AsRef<str>,
    {
        self.send_and_check(
            transport,
            socket,
            opcodes::USER_STRING_ARRAY,
            user_code,
            &pack_string_array(values)?,
        )
        .await
    }

    pub async fn send_bytes<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        user_code: i32,
        content: &[u8],
    ) -> LinkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_and_check(transport, socket, opcodes::USER_BYTES, user_code, content)
            .await
    }

    /// Returns `(user_code, string)`.
    pub async fn receive_string<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
    ) -> LinkResult<(i32, String)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = self
            .receive_expecting(transport, socket, opcodes::USER_STRING)
            .await?;
        Ok((packet.user_code, packet.content_string()?))
    }

    pub async fn receive_string_array<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
    ) -> LinkResult<(i32, Vec<String>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = self
            .receive_expecting(transport, socket, opcodes::USER_STRING_ARRAY)
            .await?;
        Ok((packet.user_code, packet.content_string_array()?))
    }

    pub async fn receive_bytes<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
    ) -> LinkResult<(i32, Bytes)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = self
            .receive_expecting(transport, socket, opcodes::USER_BYTES)
            .await?;
        Ok((packet.user_code, packet.content))
    }
}

fn ack_bytes(ack: &[u8]) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&ack[..ACK_LENGTH]);
    bytes
}
