// src/core/protocol/transfer.rs

//! Chunked file and stream transfer over MQTT-style messages.
//!
//! The sender opens with a header message carrying a packed string array
//! `[name, size, tag]` (plus the uploader when one is set), then sends
//! `ceil(size / chunk_size)` chunk messages. The receiver answers every chunk
//! with 16 bytes: cumulative bytes received and the total size, both `i64`
//! little-endian. A failure message may replace the header or any ack.

use super::hsl::{pack_string_array, unpack_string_array};
use super::mqtt::{MqttMessage, control};
use crate::config::ClientConfig;
use crate::core::errors::{LinkError, LinkResult, codes};
use crate::core::transport::{ManagedSocket, ProgressFn, Transport};
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 102_400;
const ACK_LENGTH: usize = 16;

/// The injected encryption collaborator applied to each chunk.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> LinkResult<Vec<u8>>;
    fn decrypt(&self, cipher: &[u8]) -> LinkResult<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileTransferDescriptor {
    pub name: String,
    pub size: u64,
    pub tag: String,
    pub uploader: String,
}

impl FileTransferDescriptor {
    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        let size = self.size.to_string();
        let mut fields = vec![self.name.as_str(), size.as_str(), self.tag.as_str()];
        if !self.uploader.is_empty() {
            fields.push(self.uploader.as_str());
        }
        pack_string_array(&fields)
    }

    pub fn decode(bytes: &[u8]) -> LinkResult<Self> {
        let mut fields = unpack_string_array(bytes)?.into_iter();
        let (Some(name), Some(size), Some(tag)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(LinkError::Protocol(
                "transfer header needs name, size and tag".to_string(),
            ));
        };
        Ok(Self {
            name,
            size: size.trim().parse()?,
            tag,
            uploader: fields.next().unwrap_or_default(),
        })
    }
}

/// Where outgoing transfer data comes from.
pub enum TransferSource {
    Path(PathBuf),
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: u64,
    },
}

impl fmt::Debug for TransferSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            TransferSource::Reader { size, .. } => {
                f.debug_struct("Reader").field("size", size).finish()
            }
        }
    }
}

/// Number of chunk messages a transfer of `size` bytes takes.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size.max(1) as u64)
}

/// Transfer settings shared by both directions.
#[derive(Clone)]
pub struct FileTransfer {
    chunk_size: usize,
    cipher: Option<Arc<dyn PayloadCipher>>,
    timeout: Option<Duration>,
    progress: Option<Arc<ProgressFn>>,
}

impl fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransfer")
            .field("chunk_size", &self.chunk_size)
            .field("encrypted", &self.cipher.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for FileTransfer {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cipher: None,
            timeout: None,
            progress: None,
        }
    }
}

impl From<&ClientConfig> for FileTransfer {
    fn from(config: &ClientConfig) -> Self {
        let timeout = u64::try_from(config.receive_timeout_ms)
            .ok()
            .map(Duration::from_millis);
        Self::new()
            .with_chunk_size(config.file_chunk_size)
            .with_timeout(timeout)
    }
}

impl FileTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressFn>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn report(&self, done: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(done, total);
        }
    }

    /// Tells the peer the transfer cannot proceed.
    pub async fn send_failure<S: AsyncWrite + Unpin>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        reason: &str,
    ) -> LinkResult<()> {
        transport
            .send_mqtt(socket, &MqttMessage::failure(reason))
            .await
            .map(|_| ())
    }

    /// Sends `source` under the name, tag and uploader in `descriptor`. The
    /// size is taken from the source. Returns the descriptor as sent.
    pub async fn send<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        mut descriptor: FileTransferDescriptor,
        source: TransferSource,
    ) -> LinkResult<FileTransferDescriptor>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, size): (Box<dyn AsyncRead + Send + Unpin>, u64) = match source {
            TransferSource::Path(path) => match open_source(&path).await {
                Some(opened) => opened,
                None => {
                    warn!("Transfer source {} does not exist.", path.display());
                    self.send_failure(transport, socket, "file not exists").await?;
                    return Err(LinkError::Application {
                        code: codes::TRANSFER_FAILED,
                        message: format!("file not exists: {}", path.display()),
                    });
                }
            },
            TransferSource::Reader { reader, size } => (reader, size),
        };
        descriptor.size = size;

        transport
            .send_mqtt(
                socket,
                &MqttMessage::new(control::FILE_NO_SENSE, descriptor.encode()?),
            )
            .await?;

        let mut sent: u64 = 0;
        let mut chunk = vec![0u8; self.chunk_size];
        while sent < size {
            let want = (size - sent).min(self.chunk_size as u64) as usize;
            if let Err(e) = reader.read_exact(&mut chunk[..want]).await {
                let reason = format!("source read failed: {e}");
                self.send_failure(transport, socket, &reason).await?;
                return Err(LinkError::Application {
                    code: codes::TRANSFER_FAILED,
                    message: reason,
                });
            }
            let body = match &self.cipher {
                Some(cipher) => cipher.encrypt(&chunk[..want])?,
                None => chunk[..want].to_vec(),
            };
            transport
                .send_mqtt(socket, &MqttMessage::new(control::FILE_NO_SENSE, body))
                .await?;
            sent += want as u64;

            let ack = transport.receive_mqtt(socket, self.timeout).await?;
            if let Some(reason) = ack.failure_reason() {
                return Err(LinkError::Application {
                    code: codes::TRANSFER_FAILED,
                    message: reason,
                });
            }
            let (received, total) = match parse_ack(&ack.payload) {
                Ok(counts) => counts,
                Err(e) => {
                    socket.abort();
                    return Err(e);
                }
            };
            if received != sent as i64 || total != size as i64 {
                socket.abort();
                return Err(LinkError::LengthMismatch {
                    sent: sent as i64,
                    acknowledged: received,
                });
            }
            self.report(sent, size);
        }
        debug!("Sent {} ({} bytes).", descriptor.name, size);
        Ok(descriptor)
    }

    /// Receives a transfer into `sink`, acknowledging each chunk.
    pub async fn receive<S, W>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        sink: &mut W,
    ) -> LinkResult<FileTransferDescriptor>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header = transport.receive_mqtt(socket, self.timeout).await?;
        if let Some(reason) = header.failure_reason() {
            return Err(LinkError::Application {
                code: codes::TRANSFER_FAILED,
                message: reason,
            });
        }
        let descriptor = match FileTransferDescriptor::decode(&header.payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                socket.abort();
                return Err(e);
            }
        };

        let mut received: u64 = 0;
        while received < descriptor.size {
            let message = transport.receive_mqtt(socket, self.timeout).await?;
            if let Some(reason) = message.failure_reason() {
                return Err(LinkError::Application {
                    code: codes::TRANSFER_FAILED,
                    message: reason,
                });
            }
            let plain = match &self.cipher {
                Some(cipher) => cipher.decrypt(&message.payload)?,
                None => message.payload.to_vec(),
            };
            if plain.is_empty() || received + plain.len() as u64 > descriptor.size {
                socket.abort();
                return Err(LinkError::Protocol(format!(
                    "chunk of {} bytes does not fit the remaining {} bytes",
                    plain.len(),
                    descriptor.size - received
                )));
            }

            if let Err(e) = sink.write_all(&plain).await {
                let reason = format!("sink write failed: {e}");
                self.send_failure(transport, socket, &reason).await?;
                return Err(LinkError::Application {
                    code: codes::TRANSFER_FAILED,
                    message: reason,
                });
            }
            received += plain.len() as u64;

            let mut ack = Vec::with_capacity(ACK_LENGTH);
            ack.extend_from_slice(&(received as i64).to_le_bytes());
            ack.extend_from_slice(&(descriptor.size as i64).to_le_bytes());
            transport
                .send_mqtt(socket, &MqttMessage::new(control::FILE_NO_SENSE, ack))
                .await?;
            self.report(received, descriptor.size);
        }
        sink.flush().await?;
        debug!("Received {} ({} bytes).", descriptor.name, received);
        Ok(descriptor)
    }

    /// Receives a transfer into a newly created file at `path`.
    pub async fn receive_to_path<S>(
        &self,
        transport: &Transport,
        socket: &mut ManagedSocket<S>,
        path: &Path,
    ) -> LinkResult<FileTransferDescriptor>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut file = tokio::fs::File::create(path).await?;
        self.receive(transport, socket, &mut file).await
    }
}

async fn open_source(path: &Path) -> Option<(Box<dyn AsyncRead + Send + Unpin>, u64)> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let size = file.metadata().await.ok()?.len();
    let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(file);
    Some((reader, size))
}

fn parse_ack(payload: &Bytes) -> LinkResult<(i64, i64)> {
    if payload.len() != ACK_LENGTH {
        return Err(LinkError::Protocol(format!(
            "transfer ack has {} bytes, expected {ACK_LENGTH}",
            payload.len()
        )));
    }
    let mut received = [0u8; 8];
    let mut total = [0u8; 8];
    received.copy_from_slice(&payload[..8]);
    total.copy_from_slice(&payload[8..]);
    Ok((i64::from_le_bytes(received), i64::from_le_bytes(total)))
}
