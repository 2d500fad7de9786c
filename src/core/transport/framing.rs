// src/core/transport/framing.rs

//! The message framing engine: a fixed-length header, then a content length
//! computed from that header by a pluggable descriptor.

use super::primitives::{Progress, ProgressFn, Transport};
use super::socket::ManagedSocket;
use crate::core::errors::{LinkError, LinkResult};
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::warn;

/// Upper bound on a single message body.
pub const MAX_MESSAGE_CONTENT: usize = 512 * 1024 * 1024;

/// Describes how one protocol delimits a message on the wire.
pub trait MessageDescriptor: Send + Sync {
    /// Length of the fixed header that starts every message.
    fn header_length(&self) -> usize;

    /// Remaining content length given the header. Zero or less means the
    /// header is the whole message.
    fn content_length(&self, header: &[u8]) -> i64;

    /// Validates a received frame against the request context. The default
    /// accepts everything.
    fn check_header(&self, _frame: &[u8]) -> LinkResult<()> {
        Ok(())
    }

    /// Records the bytes that were sent, for protocols whose responses echo
    /// parts of the request.
    fn set_sent_bytes(&mut self, _sent: &[u8]) {}

    fn sent_bytes(&self) -> Option<&[u8]> {
        None
    }
}

impl Transport {
    /// Receives one complete message as described by `descriptor`.
    pub async fn receive_by_message<S, D>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
        descriptor: &D,
        progress: Option<&ProgressFn>,
    ) -> LinkResult<Vec<u8>>
    where
        S: AsyncRead + Unpin,
        D: MessageDescriptor + ?Sized,
    {
        let header_length = descriptor.header_length();
        let header = self.receive_exact(socket, header_length, timeout).await?;
        let content_length = descriptor.content_length(&header);
        if content_length <= 0 {
            return Ok(header);
        }

        let content_length = content_length as u64;
        if content_length > MAX_MESSAGE_CONTENT as u64 {
            warn!(
                "Refusing message with {} content bytes (limit {}).",
                content_length, MAX_MESSAGE_CONTENT
            );
            socket.abort();
            return Err(LinkError::Protocol(format!(
                "message content length {content_length} exceeds the {MAX_MESSAGE_CONTENT} byte limit"
            )));
        }

        let mut frame = vec![0u8; header_length + content_length as usize];
        frame[..header_length].copy_from_slice(&header);
        let progress = progress.map(|report| Progress {
            report,
            base: 0,
            total: content_length,
        });
        self.receive_into(socket, &mut frame[header_length..], timeout, progress)
            .await?;
        Ok(frame)
    }
}

/// A 4-byte little-endian length header followed by the payload.
#[derive(Debug, Clone, Default)]
pub struct LengthPrefixedMessage {
    sent: Option<Vec<u8>>,
}

impl LengthPrefixedMessage {
    pub const HEADER_LENGTH: usize = 4;

    pub fn new() -> Self {
        Self::default()
    }

    /// Frames `payload` for the wire.
    pub fn frame(payload: &[u8]) -> LinkResult<Vec<u8>> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            LinkError::InvalidArgument(format!("payload of {} bytes is too large", payload.len()))
        })?;
        let mut frame = Vec::with_capacity(Self::HEADER_LENGTH + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Strips the header from a received frame.
    pub fn payload(frame: &[u8]) -> LinkResult<&[u8]> {
        frame
            .get(Self::HEADER_LENGTH..)
            .ok_or(LinkError::IncompleteData)
    }
}

impl MessageDescriptor for LengthPrefixedMessage {
    fn header_length(&self) -> usize {
        Self::HEADER_LENGTH
    }

    fn content_length(&self, header: &[u8]) -> i64 {
        match header.get(..4) {
            Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            None => 0,
        }
    }

    fn set_sent_bytes(&mut self, sent: &[u8]) {
        self.sent = Some(sent.to_vec());
    }

    fn sent_bytes(&self) -> Option<&[u8]> {
        self.sent.as_deref()
    }
}
