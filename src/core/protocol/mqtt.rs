// src/core/protocol/mqtt.rs

//! MQTT-style control messages: a head byte, the variable-length "remaining
//! length" field, then the payload.

use crate::core::errors::{LinkError, LinkResult};
use crate::core::transport::{ManagedSocket, Transport};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Largest value the 4-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;
const MAX_LENGTH_BYTES: usize = 4;
const CONTINUATION_BIT: u8 = 0x80;

/// Head bytes. Standard packet types sit in the high nibble; the transfer
/// codes above 0x0F are used as the whole head byte.
pub mod control {
    /// In-band failure: the payload is a UTF-8 reason.
    pub const FAILED: u8 = 0x00;
    pub const CONNECT: u8 = 0x01;
    pub const CONNACK: u8 = 0x02;
    pub const PUBLISH: u8 = 0x03;
    pub const PUBACK: u8 = 0x04;
    pub const SUBSCRIBE: u8 = 0x08;
    pub const SUBACK: u8 = 0x09;
    pub const PINGREQ: u8 = 0x0C;
    pub const PINGRESP: u8 = 0x0D;
    pub const DISCONNECT: u8 = 0x0E;
    /// Transfer data with no further meaning: headers, chunks and acks.
    pub const FILE_NO_SENSE: u8 = 100;
    pub const FILE_DOWNLOAD: u8 = 101;
    pub const FILE_UPLOAD: u8 = 102;
    pub const FILE_DELETE: u8 = 103;
}

pub fn encode_remaining_length(length: usize) -> LinkResult<Vec<u8>> {
    if length > MAX_REMAINING_LENGTH {
        return Err(LinkError::InvalidArgument(format!(
            "remaining length {length} exceeds {MAX_REMAINING_LENGTH}"
        )));
    }
    let mut encoded = Vec::with_capacity(MAX_LENGTH_BYTES);
    let mut value = length;
    loop {
        let mut digit = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            digit |= CONTINUATION_BIT;
        }
        encoded.push(digit);
        if value == 0 {
            return Ok(encoded);
        }
    }
}

/// Decodes a remaining-length field from the start of `bytes`, returning the
/// value and how many bytes it occupied.
pub fn decode_remaining_length(bytes: &[u8]) -> LinkResult<(usize, usize)> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, &digit) in bytes.iter().take(MAX_LENGTH_BYTES).enumerate() {
        value += (digit & !CONTINUATION_BIT) as usize * multiplier;
        if digit & CONTINUATION_BIT == 0 {
            return Ok((value, index + 1));
        }
        multiplier *= 128;
    }
    if bytes.len() >= MAX_LENGTH_BYTES {
        Err(LinkError::Protocol(
            "remaining length continues past four bytes".to_string(),
        ))
    } else {
        Err(LinkError::IncompleteData)
    }
}

/// One control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub head: u8,
    pub payload: Bytes,
}

impl MqttMessage {
    pub fn new(head: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            head,
            payload: payload.into(),
        }
    }

    /// A standard packet: `control` in the high nibble, `flags` in the low one.
    pub fn packet(control: u8, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self::new((control << 4) | (flags & 0x0F), payload)
    }

    pub fn failure(reason: &str) -> Self {
        Self::new(control::FAILED, Bytes::copy_from_slice(reason.as_bytes()))
    }

    pub fn is_failure(&self) -> bool {
        self.head == control::FAILED
    }

    /// The failure reason, when this is a failure message.
    pub fn failure_reason(&self) -> Option<String> {
        self.is_failure()
            .then(|| String::from_utf8_lossy(&self.payload).to_string())
    }

    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        let length = encode_remaining_length(self.payload.len())?;
        let mut wire = Vec::with_capacity(1 + length.len() + self.payload.len());
        wire.push(self.head);
        wire.extend_from_slice(&length);
        wire.extend_from_slice(&self.payload);
        Ok(wire)
    }
}

impl Transport {
    /// Reads a remaining-length field one byte at a time.
    pub async fn receive_remaining_length<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
    ) -> LinkResult<usize> {
        let mut field = Vec::with_capacity(MAX_LENGTH_BYTES);
        loop {
            let digit = self.receive_exact(socket, 1, timeout).await?;
            field.push(digit[0]);
            match decode_remaining_length(&field) {
                Ok((value, _)) => return Ok(value),
                Err(LinkError::IncompleteData) => continue,
                Err(e) => {
                    socket.abort();
                    return Err(e);
                }
            }
        }
    }

    pub async fn send_mqtt<S: AsyncWrite + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        message: &MqttMessage,
    ) -> LinkResult<usize> {
        self.send(socket, &message.encode()?).await
    }

    pub async fn receive_mqtt<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
    ) -> LinkResult<MqttMessage> {
        let head = self.receive_exact(socket, 1, timeout).await?;
        let length = self.receive_remaining_length(socket, timeout).await?;
        let payload = self.receive_exact(socket, length, timeout).await?;
        Ok(MqttMessage::new(head[0], payload))
    }
}
