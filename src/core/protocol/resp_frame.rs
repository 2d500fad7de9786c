// src/core/protocol/resp_frame.rs

//! RESP (REdis Serialization Protocol) replies.
//!
//! Two views of the same wire format live here: a raw receive that returns
//! the exact reply bytes off a socket (type interpretation is left to the
//! caller), and the `RespFrame` tree with its `tokio_util::codec` pair for
//! callers that want to re-parse those bytes.

use crate::core::errors::{LinkError, LinkResult};
use crate::core::transport::{ManagedSocket, Transport};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 256;
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// An enum representing a single frame in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    pub fn encode_to_vec(&self) -> LinkResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Builds a request as an array of bulk strings, the form every Redis
/// command takes on the wire.
pub fn pack_command<T: AsRef<[u8]>>(args: &[T]) -> Vec<u8> {
    let mut packed = Vec::new();
    packed.push(b'*');
    packed.extend_from_slice(args.len().to_string().as_bytes());
    packed.extend_from_slice(CRLF);
    for arg in args {
        let arg = arg.as_ref();
        packed.push(b'$');
        packed.extend_from_slice(arg.len().to_string().as_bytes());
        packed.extend_from_slice(CRLF);
        packed.extend_from_slice(arg);
        packed.extend_from_slice(CRLF);
    }
    packed
}

/// Parses one complete raw reply into a frame tree. Trailing bytes are an error.
pub fn parse_reply(raw: &[u8]) -> LinkResult<RespFrame> {
    let mut bytes = raw;
    let frame = RespFrameCodec.decode_recursive(&mut bytes, 0)?;
    if !bytes.is_empty() {
        return Err(LinkError::Protocol(format!(
            "{} trailing bytes after reply",
            bytes.len()
        )));
    }
    Ok(frame)
}

impl Transport {
    /// Receives one reply and returns its exact wire bytes.
    ///
    /// Nested arrays are walked without recursion: each `*n` header adds `n`
    /// replies to the number still owed.
    pub async fn receive_reply<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
    ) -> LinkResult<Vec<u8>> {
        let guard = timeout.map(|delay| self.watchdog().register(socket.closer(), Some(delay)));
        let mut raw = Vec::new();
        let result = self.receive_reply_into(socket, &mut raw).await;
        if let Some(guard) = &guard {
            guard.succeed();
        }

        match result {
            Ok(()) => Ok(raw),
            Err(e) => {
                let timed_out = guard.as_ref().is_some_and(|g| g.is_timed_out());
                if timed_out && e.is_connection_error() {
                    Err(self.timed_out(timeout.unwrap_or_default()))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn receive_reply_into<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        raw: &mut Vec<u8>,
    ) -> LinkResult<()> {
        let mut owed: usize = 1;
        while owed > 0 {
            owed -= 1;
            let start = raw.len();
            self.receive_line(socket, raw).await?;
            let line = &raw[start..];
            match line[0] {
                b'+' | b'-' | b':' => {}
                b'$' => {
                    let length = parse_decimal(socket, &line[1..])?;
                    if length >= 0 {
                        let length = length as usize;
                        if length > MAX_BULK_STRING_SIZE {
                            socket.abort();
                            return Err(LinkError::Protocol(format!(
                                "bulk string of {length} bytes exceeds the limit"
                            )));
                        }
                        let body = self.receive_exact(socket, length, None).await?;
                        raw.extend_from_slice(&body);
                        let terminator = raw.len();
                        self.receive_line(socket, raw).await?;
                        if !matches!(&raw[terminator..], b"\r\n" | b"\n") {
                            socket.abort();
                            return Err(LinkError::Protocol(
                                "bulk string is longer than its declared length".to_string(),
                            ));
                        }
                    }
                }
                b'*' => {
                    let count = parse_decimal(socket, &line[1..])?;
                    if count > 0 {
                        owed += count as usize;
                        if owed > MAX_FRAME_ELEMENTS {
                            socket.abort();
                            return Err(LinkError::Protocol(
                                "reply has too many elements".to_string(),
                            ));
                        }
                    }
                }
                other => {
                    warn!("Unrecognized RESP type byte 0x{:02x}, closing.", other);
                    socket.abort();
                    return Err(LinkError::Protocol(format!(
                        "unrecognized reply type byte 0x{other:02x}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reads one byte at a time up to and including `\n`, appending to `raw`.
    async fn receive_line<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        raw: &mut Vec<u8>,
    ) -> LinkResult<()> {
        let start = raw.len();
        loop {
            let byte = self.receive_exact(socket, 1, None).await?;
            raw.push(byte[0]);
            if byte[0] == b'\n' {
                return Ok(());
            }
            if raw.len() - start > MAX_LINE_LENGTH {
                socket.abort();
                return Err(LinkError::Protocol("reply line is too long".to_string()));
            }
        }
    }
}

/// Parses the decimal after a `$` or `*` sigil, line terminator included.
fn parse_decimal<S>(socket: &mut ManagedSocket<S>, line: &[u8]) -> LinkResult<i64> {
    let text = String::from_utf8_lossy(line);
    match text.trim_end_matches(['\r', '\n']).parse::<i64>() {
        Ok(value) => Ok(value),
        Err(_) => {
            socket.abort();
            Err(LinkError::Protocol(format!(
                "invalid reply length {:?}",
                text.trim_end()
            )))
        }
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = LinkError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                dst.extend_from_slice(b"$-1\r\n");
            }
            RespFrame::NullArray => {
                dst.extend_from_slice(b"*-1\r\n");
            }
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match self.decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            // Need more data.
            Err(LinkError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl RespFrameCodec {
    /// Decodes one frame, advancing `bytes` past it.
    fn decode_recursive(&self, bytes: &mut &[u8], depth: usize) -> LinkResult<RespFrame> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(LinkError::Protocol(
                "RESP recursion depth limit exceeded".to_string(),
            ));
        }

        if bytes.is_empty() {
            return Err(LinkError::IncompleteData);
        }

        match bytes[0] {
            b'+' => self.parse_simple_string(bytes),
            b'-' => self.parse_error(bytes),
            b':' => self.parse_integer(bytes),
            b'$' => self.parse_bulk_string(bytes),
            b'*' => self.parse_array(bytes, depth),
            other => Err(LinkError::Protocol(format!(
                "unrecognized reply type byte 0x{other:02x}"
            ))),
        }
    }

    fn parse_line<'a>(&self, bytes: &mut &'a [u8]) -> LinkResult<&'a [u8]> {
        if let Some(pos) = find_crlf(bytes) {
            let line = &bytes[..pos];
            *bytes = &bytes[pos + CRLF_LEN..];
            Ok(line)
        } else {
            Err(LinkError::IncompleteData)
        }
    }

    fn parse_length(&self, bytes: &mut &[u8]) -> LinkResult<i64> {
        let line = self.parse_line(bytes)?;
        let s = String::from_utf8_lossy(line);
        s.parse::<i64>()
            .map_err(|_| LinkError::Protocol(format!("invalid reply length {s:?}")))
    }

    /// Parses a Simple String (e.g., `+OK\r\n`).
    fn parse_simple_string(&self, bytes: &mut &[u8]) -> LinkResult<RespFrame> {
        *bytes = &bytes[1..];
        let line = self.parse_line(bytes)?;
        Ok(RespFrame::SimpleString(
            String::from_utf8_lossy(line).to_string(),
        ))
    }

    /// Parses an Error (e.g., `-ERR message\r\n`).
    fn parse_error(&self, bytes: &mut &[u8]) -> LinkResult<RespFrame> {
        *bytes = &bytes[1..];
        let line = self.parse_line(bytes)?;
        Ok(RespFrame::Error(String::from_utf8_lossy(line).to_string()))
    }

    /// Parses an Integer (e.g., `:1000\r\n`).
    fn parse_integer(&self, bytes: &mut &[u8]) -> LinkResult<RespFrame> {
        *bytes = &bytes[1..];
        Ok(RespFrame::Integer(self.parse_length(bytes)?))
    }

    /// Parses a Bulk String (e.g., `$5\r\nhello\r\n`).
    fn parse_bulk_string(&self, bytes: &mut &[u8]) -> LinkResult<RespFrame> {
        *bytes = &bytes[1..];
        let str_len = self.parse_length(bytes)?;
        if str_len < 0 {
            return Ok(RespFrame::Null);
        }

        let str_len = str_len as usize;
        if str_len > MAX_BULK_STRING_SIZE {
            return Err(LinkError::Protocol(format!(
                "bulk string of {str_len} bytes exceeds the limit"
            )));
        }
        if bytes.len() < str_len + CRLF_LEN {
            return Err(LinkError::IncompleteData);
        }
        if &bytes[str_len..str_len + CRLF_LEN] != CRLF {
            return Err(LinkError::Protocol(
                "bulk string is not terminated by CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&bytes[..str_len]);
        *bytes = &bytes[str_len + CRLF_LEN..];
        Ok(RespFrame::BulkString(data))
    }

    /// Parses an Array (e.g., `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`).
    fn parse_array(&self, bytes: &mut &[u8], depth: usize) -> LinkResult<RespFrame> {
        *bytes = &bytes[1..];
        let arr_len = self.parse_length(bytes)?;
        if arr_len < 0 {
            return Ok(RespFrame::NullArray);
        }

        let arr_len = arr_len as usize;
        if arr_len > MAX_FRAME_ELEMENTS {
            return Err(LinkError::Protocol(
                "reply has too many elements".to_string(),
            ));
        }

        let mut frames = Vec::with_capacity(arr_len.min(bytes.len()));
        for _ in 0..arr_len {
            frames.push(self.decode_recursive(bytes, depth + 1)?);
        }
        Ok(RespFrame::Array(frames))
    }
}

/// Splits complete raw replies off a buffered stream without interpreting them.
#[derive(Debug, Default)]
pub struct RespReplyCodec;

impl Decoder for RespReplyCodec {
    type Item = Bytes;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut bytes = &src[..];
        match RespFrameCodec.decode_recursive(&mut bytes, 0) {
            Ok(_) => {
                let len = src.len() - bytes.len();
                Ok(Some(src.split_to(len).freeze()))
            }
            Err(LinkError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
