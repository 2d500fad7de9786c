// src/core/protocol/websocket.rs

//! WebSocket (RFC 6455) data framing.
//!
//! Only framing is handled here; the HTTP upgrade handshake belongs to the
//! caller. A logical message is the concatenation of frame payloads up to and
//! including the first frame with `fin` set.

use crate::core::errors::{LinkError, LinkResult};
use crate::core::transport::{MAX_MESSAGE_CONTENT, ManagedSocket, Transport};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder};

pub mod opcodes {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0F;
const LENGTH_BITS: u8 = 0x7F;
/// Largest length that fits the 7-bit field.
const SHORT_LENGTH_MAX: usize = 125;
const EXTENDED_16: u8 = 126;
const EXTENDED_64: u8 = 127;

/// One physical frame. The payload is always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl WebSocketFrame {
    pub fn new(fin: bool, opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(true, opcodes::TEXT, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, opcodes::BINARY, payload)
    }

    /// Clients must mask every frame they send.
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(14 + self.payload.len());
        self.encode_into(&mut wire);
        wire
    }

    fn encode_into(&self, wire: &mut impl Extend<u8>) {
        let first = (if self.fin { FIN_BIT } else { 0 }) | (self.opcode & OPCODE_BITS);
        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        let length = self.payload.len();
        wire.extend([first]);
        if length <= SHORT_LENGTH_MAX {
            wire.extend([mask_bit | length as u8]);
        } else if length <= u16::MAX as usize {
            wire.extend([mask_bit | EXTENDED_16]);
            wire.extend((length as u16).to_be_bytes());
        } else {
            wire.extend([mask_bit | EXTENDED_64]);
            wire.extend((length as u64).to_be_bytes());
        }
        match self.mask {
            Some(key) => {
                wire.extend(key);
                let mut payload = self.payload.to_vec();
                apply_mask(&mut payload, key);
                wire.extend(payload);
            }
            None => wire.extend(self.payload.iter().copied()),
        }
    }

    /// Decodes one frame from `bytes`, advancing past it. Returns
    /// `IncompleteData` when more input is needed.
    pub fn decode(bytes: &mut &[u8]) -> LinkResult<Self> {
        let header: &[u8] = *bytes;
        if header.len() < 2 {
            return Err(LinkError::IncompleteData);
        }
        let (fin, opcode, masked, short) = split_header([header[0], header[1]]);
        let mut offset = 2;
        let length = match short {
            EXTENDED_16 => {
                let field = header.get(2..4).ok_or(LinkError::IncompleteData)?;
                offset += 2;
                u16::from_be_bytes([field[0], field[1]]) as u64
            }
            EXTENDED_64 => {
                let field = header.get(2..10).ok_or(LinkError::IncompleteData)?;
                offset += 8;
                let mut length = [0u8; 8];
                length.copy_from_slice(field);
                u64::from_be_bytes(length)
            }
            short => short as u64,
        };
        let length = checked_length(length)?;
        let mask = if masked {
            let field = header
                .get(offset..offset + 4)
                .ok_or(LinkError::IncompleteData)?;
            offset += 4;
            Some([field[0], field[1], field[2], field[3]])
        } else {
            None
        };
        let body = header
            .get(offset..offset + length)
            .ok_or(LinkError::IncompleteData)?;
        let mut payload = body.to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        *bytes = &header[offset + length..];
        Ok(Self {
            fin,
            opcode,
            mask,
            payload: Bytes::from(payload),
        })
    }
}

fn split_header(header: [u8; 2]) -> (bool, u8, bool, u8) {
    (
        header[0] & FIN_BIT != 0,
        header[0] & OPCODE_BITS,
        header[1] & MASK_BIT != 0,
        header[1] & LENGTH_BITS,
    )
}

fn checked_length(length: u64) -> LinkResult<usize> {
    if length > MAX_MESSAGE_CONTENT as u64 {
        return Err(LinkError::Protocol(format!(
            "frame payload of {length} bytes exceeds the limit"
        )));
    }
    Ok(length as usize)
}

/// XORs `payload` with the repeating 4-byte key. Applying it twice restores
/// the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// A reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketMessage {
    /// Opcode of the first frame.
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl WebSocketMessage {
    pub fn text(&self) -> LinkResult<String> {
        Ok(String::from_utf8(self.payload.clone())?)
    }
}

impl Transport {
    /// Receives one frame off the socket.
    pub async fn receive_frame<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
    ) -> LinkResult<WebSocketFrame> {
        let header = self.receive_exact(socket, 2, timeout).await?;
        let (fin, opcode, masked, short) = split_header([header[0], header[1]]);
        let length = match short {
            EXTENDED_16 => {
                let field = self.receive_exact(socket, 2, timeout).await?;
                u16::from_be_bytes([field[0], field[1]]) as u64
            }
            EXTENDED_64 => {
                let field = self.receive_exact(socket, 8, timeout).await?;
                let mut length = [0u8; 8];
                length.copy_from_slice(&field);
                u64::from_be_bytes(length)
            }
            short => short as u64,
        };
        let length = match checked_length(length) {
            Ok(length) => length,
            Err(e) => {
                socket.abort();
                return Err(e);
            }
        };
        let mask = if masked {
            let key = self.receive_exact(socket, 4, timeout).await?;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };
        let mut payload = self.receive_exact(socket, length, timeout).await?;
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        Ok(WebSocketFrame {
            fin,
            opcode,
            mask,
            payload: Bytes::from(payload),
        })
    }

    /// Receives frames until one has `fin` set and joins their payloads.
    pub async fn receive_message<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
    ) -> LinkResult<WebSocketMessage> {
        let first = self.receive_frame(socket, timeout).await?;
        let opcode = first.opcode;
        let mut payload = first.payload.to_vec();
        let mut fin = first.fin;
        while !fin {
            let frame = self.receive_frame(socket, timeout).await?;
            if payload.len() + frame.payload.len() > MAX_MESSAGE_CONTENT {
                socket.abort();
                return Err(LinkError::Protocol(
                    "fragmented message exceeds the size limit".to_string(),
                ));
            }
            payload.extend_from_slice(&frame.payload);
            fin = frame.fin;
        }
        Ok(WebSocketMessage { opcode, payload })
    }
}

/// A `tokio_util::codec` pair for frames on a buffered stream.
#[derive(Debug, Default)]
pub struct WebSocketCodec;

impl Decoder for WebSocketCodec {
    type Item = WebSocketFrame;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut bytes = &src[..];
        match WebSocketFrame::decode(&mut bytes) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            Err(LinkError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<WebSocketFrame> for WebSocketCodec {
    type Error = LinkError;

    fn encode(&mut self, item: WebSocketFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(14 + item.payload.len());
        item.encode_into(dst);
        Ok(())
    }
}
