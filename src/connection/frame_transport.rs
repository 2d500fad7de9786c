// src/connection/frame_transport.rs

//! How a connection frames its requests and recognizes its responses.

use crate::core::LinkResult;
use crate::core::protocol::HslMessage;
use crate::core::transport::{LengthPrefixedMessage, MessageDescriptor};
use uuid::Uuid;

pub trait FrameTransport: Send + Sync {
    type Descriptor: MessageDescriptor;

    /// A fresh descriptor for one response.
    fn new_descriptor(&self) -> Self::Descriptor;

    /// Turns a caller command into wire bytes. The default sends it as is.
    fn pack_command(&self, command: &[u8]) -> LinkResult<Vec<u8>> {
        Ok(command.to_vec())
    }

    /// Extracts the caller-facing response from a received frame. The default
    /// returns the whole frame.
    fn unpack_response(&self, _sent: &[u8], frame: &[u8]) -> LinkResult<Vec<u8>> {
        Ok(frame.to_vec())
    }
}

/// Payloads travel behind a 4-byte little-endian length.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedTransport;

impl FrameTransport for LengthPrefixedTransport {
    type Descriptor = LengthPrefixedMessage;

    fn new_descriptor(&self) -> Self::Descriptor {
        LengthPrefixedMessage::new()
    }

    fn pack_command(&self, command: &[u8]) -> LinkResult<Vec<u8>> {
        LengthPrefixedMessage::frame(command)
    }

    fn unpack_response(&self, _sent: &[u8], frame: &[u8]) -> LinkResult<Vec<u8>> {
        Ok(LengthPrefixedMessage::payload(frame)?.to_vec())
    }
}

/// Commands are complete envelopes; responses must carry the shared token.
#[derive(Debug, Clone, Copy)]
pub struct HslTransport {
    token: Uuid,
}

impl HslTransport {
    pub fn new(token: Uuid) -> Self {
        Self { token }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

impl FrameTransport for HslTransport {
    type Descriptor = HslMessage;

    fn new_descriptor(&self) -> Self::Descriptor {
        HslMessage::with_token(self.token)
    }
}
