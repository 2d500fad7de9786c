// src/core/transport/primitives.rs

//! Byte-level send and receive primitives.
//!
//! Every receive races the stream against the socket's closer, and timed
//! receives register with the watchdog first. Any failure closes the socket:
//! callers must treat an error here as connection-invalidating.

use super::socket::{ManagedSocket, SocketCloser};
use crate::core::errors::{LinkError, LinkResult};
use crate::core::metrics;
use crate::core::watchdog::TimeoutWatchdog;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// The error counter saturates here.
pub const ERROR_COUNTER_CAP: i32 = 100_000_000;
/// Scratch buffer size for "read what is there" receives.
pub const SCRATCH_BUFFER_SIZE: usize = 16 * 1024;
/// Granularity of progress reports while filling large buffers.
const PROGRESS_CHUNK: usize = 16 * 1024;

/// Progress callback invoked with `(bytes_so_far, bytes_total)`.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// A saturating count of connection-level failures, shared per transport.
#[derive(Debug, Default)]
pub struct ErrorCounter(AtomicI32);

impl ErrorCounter {
    /// Increments the counter (stopping at the cap) and returns the new value.
    pub fn increment(&self) -> i32 {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current < ERROR_COUNTER_CAP {
                    current + 1
                } else {
                    current
                })
            })
            .unwrap_or(ERROR_COUNTER_CAP);
        (previous + 1).min(ERROR_COUNTER_CAP)
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// How many bytes a receive should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSize {
    /// Exactly this many bytes, looping over partial reads.
    Exact(usize),
    /// One read of whatever is available, up to [`SCRATCH_BUFFER_SIZE`].
    Available,
}

impl ReadSize {
    /// Maps the signed wire convention: negative means "whatever is there".
    pub fn from_length(length: i64) -> Self {
        if length < 0 {
            ReadSize::Available
        } else {
            ReadSize::Exact(length as usize)
        }
    }
}

/// Progress reporting state for a buffer fill.
#[derive(Clone, Copy)]
pub struct Progress<'a> {
    pub report: &'a ProgressFn,
    /// Bytes already accounted for before this fill started.
    pub base: u64,
    pub total: u64,
}

enum ReadFailure {
    RemoteClosed,
    Closed,
    Io(io::Error),
}

/// The send/receive engine shared by connections and servers.
#[derive(Debug, Clone)]
pub struct Transport {
    watchdog: TimeoutWatchdog,
    errors: Arc<ErrorCounter>,
}

impl Transport {
    pub fn new(watchdog: TimeoutWatchdog) -> Self {
        Self {
            watchdog,
            errors: Arc::new(ErrorCounter::default()),
        }
    }

    /// Creates a transport with its own watchdog already sweeping.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_running_watchdog() -> Self {
        let watchdog = TimeoutWatchdog::new();
        watchdog.start();
        Self::new(watchdog)
    }

    pub fn watchdog(&self) -> &TimeoutWatchdog {
        &self.watchdog
    }

    pub fn error_counter(&self) -> &ErrorCounter {
        &self.errors
    }

    /// Bumps the error counter and builds a connection-class failure.
    pub fn connection_failure(&self, message: impl Into<String>) -> LinkError {
        metrics::SOCKET_ERRORS_TOTAL.inc();
        LinkError::Connection {
            code: -self.errors.increment(),
            message: message.into(),
        }
    }

    fn remote_closed(&self) -> LinkError {
        metrics::SOCKET_ERRORS_TOTAL.inc();
        LinkError::RemoteClosed {
            code: -self.errors.increment(),
        }
    }

    pub(crate) fn timed_out(&self, elapsed: Duration) -> LinkError {
        metrics::SOCKET_ERRORS_TOTAL.inc();
        LinkError::Timeout {
            code: -self.errors.increment(),
            elapsed,
        }
    }

    /// Writes the whole buffer, looping over partial writes.
    pub async fn send<S: AsyncWrite + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        data: &[u8],
    ) -> LinkResult<usize> {
        let result = {
            let (stream, closer) = socket.parts()?;
            write_counted(stream, closer, data).await
        };
        match result {
            Ok(sent) => {
                metrics::BYTES_SENT_TOTAL.inc_by(sent as f64);
                Ok(sent)
            }
            Err(e) => {
                socket.abort();
                Err(self.connection_failure(format!("send failed: {e}")))
            }
        }
    }

    /// Receives according to `size` within an optional deadline.
    pub async fn receive<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        size: ReadSize,
        timeout: Option<Duration>,
    ) -> LinkResult<Vec<u8>> {
        match size {
            ReadSize::Exact(length) => self.receive_exact(socket, length, timeout).await,
            ReadSize::Available => self.receive_available(socket, timeout).await,
        }
    }

    /// Receives exactly `length` bytes.
    pub async fn receive_exact<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        length: usize,
        timeout: Option<Duration>,
    ) -> LinkResult<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        self.receive_into(socket, &mut buffer, timeout, None).await?;
        Ok(buffer)
    }

    /// Fills `buffer` completely, reporting progress as chunks arrive.
    pub async fn receive_into<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        buffer: &mut [u8],
        timeout: Option<Duration>,
        progress: Option<Progress<'_>>,
    ) -> LinkResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let guard = timeout.map(|delay| self.watchdog.register(socket.closer(), Some(delay)));
        let result = {
            let (stream, closer) = socket.parts()?;
            fill(stream, closer, buffer, progress).await
        };
        if let Some(guard) = &guard {
            guard.succeed();
        }

        match result {
            Ok(()) => {
                metrics::BYTES_RECEIVED_TOTAL.inc_by(buffer.len() as f64);
                Ok(())
            }
            Err(failure) => {
                socket.abort();
                let timed_out = guard.as_ref().is_some_and(|g| g.is_timed_out());
                Err(self.classify(failure, timed_out, timeout))
            }
        }
    }

    /// Performs a single read and returns whatever arrived.
    pub async fn receive_available<S: AsyncRead + Unpin>(
        &self,
        socket: &mut ManagedSocket<S>,
        timeout: Option<Duration>,
    ) -> LinkResult<Vec<u8>> {
        let guard = timeout.map(|delay| self.watchdog.register(socket.closer(), Some(delay)));
        let mut scratch = vec![0u8; SCRATCH_BUFFER_SIZE];
        let result = {
            let (stream, closer) = socket.parts()?;
            read_once(stream, closer, &mut scratch).await
        };
        if let Some(guard) = &guard {
            guard.succeed();
        }

        match result {
            Ok(count) => {
                scratch.truncate(count);
                metrics::BYTES_RECEIVED_TOTAL.inc_by(count as f64);
                Ok(scratch)
            }
            Err(failure) => {
                socket.abort();
                let timed_out = guard.as_ref().is_some_and(|g| g.is_timed_out());
                Err(self.classify(failure, timed_out, timeout))
            }
        }
    }

    fn classify(
        &self,
        failure: ReadFailure,
        timed_out: bool,
        timeout: Option<Duration>,
    ) -> LinkError {
        if timed_out {
            return self.timed_out(timeout.unwrap_or_default());
        }
        match failure {
            ReadFailure::RemoteClosed => {
                debug!("Remote closed the connection during receive.");
                self.remote_closed()
            }
            ReadFailure::Closed => LinkError::SocketClosed,
            ReadFailure::Io(e) => self.connection_failure(format!("receive failed: {e}")),
        }
    }
}

async fn write_counted<S: AsyncWrite + Unpin>(
    stream: &mut S,
    closer: &SocketCloser,
    data: &[u8],
) -> io::Result<usize> {
    let mut sent = 0;
    while sent < data.len() {
        let written = tokio::select! {
            biased;
            _ = closer.closed() => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "socket was closed"));
            }
            result = stream.write(&data[sent..]) => result?,
        };
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer stopped accepting data",
            ));
        }
        sent += written;
    }
    tokio::select! {
        biased;
        _ = closer.closed() => Err(io::Error::new(io::ErrorKind::NotConnected, "socket was closed")),
        result = stream.flush() => result.map(|_| sent),
    }
}

async fn fill<S: AsyncRead + Unpin>(
    stream: &mut S,
    closer: &SocketCloser,
    buffer: &mut [u8],
    progress: Option<Progress<'_>>,
) -> Result<(), ReadFailure> {
    let mut filled = 0;
    while filled < buffer.len() {
        let end = match progress {
            Some(_) => buffer.len().min(filled + PROGRESS_CHUNK),
            None => buffer.len(),
        };
        let count = read_once(stream, closer, &mut buffer[filled..end]).await?;
        filled += count;
        if let Some(p) = progress {
            (p.report)(p.base + filled as u64, p.total);
        }
    }
    Ok(())
}

async fn read_once<S: AsyncRead + Unpin>(
    stream: &mut S,
    closer: &SocketCloser,
    buffer: &mut [u8],
) -> Result<usize, ReadFailure> {
    let result = tokio::select! {
        biased;
        _ = closer.closed() => return Err(ReadFailure::Closed),
        result = stream.read(buffer) => result,
    };
    match result {
        Ok(0) => Err(ReadFailure::RemoteClosed),
        Ok(count) => Ok(count),
        Err(e) => Err(ReadFailure::Io(e)),
    }
}
