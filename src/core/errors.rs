// src/core/errors.rs

//! Defines the primary error type shared by every transport operation.

use crate::core::protocol::alien::LoginStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fixed correlation codes for failures that do not touch the error counter.
pub mod codes {
    pub const PROTOCOL: i32 = -10_000;
    pub const TOKEN_MISMATCH: i32 = -10_001;
    pub const OPCODE_MISMATCH: i32 = -10_002;
    pub const LENGTH_MISMATCH: i32 = -10_003;
    pub const SOCKET_CLOSED: i32 = -10_004;
    pub const INVALID_ARGUMENT: i32 = -10_005;
    pub const UNSUPPORTED: i32 = -10_006;
    pub const LOGIN_REJECTED: i32 = -10_007;
    pub const INCOMPLETE: i32 = -10_008;
    pub const TRANSFER_FAILED: i32 = -10_009;
}

/// The main error enum for the transport core.
///
/// Connection-class variants carry the negated value of the owning transport's
/// error counter at the time of failure, which callers use as a rough
/// correlation code across log lines.
#[derive(Error, Debug, Clone)]
pub enum LinkError {
    /// A connect, send or receive call failed at the socket level.
    #[error("socket error [{code}]: {message}")]
    Connection { code: i32, message: String },

    /// The peer performed an orderly shutdown (zero-byte read).
    #[error("remote closed the connection [{code}]")]
    RemoteClosed { code: i32 },

    /// The socket was already closed, either by its owner or by the watchdog.
    #[error("socket is closed")]
    SocketClosed,

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The watchdog forcibly closed the socket while an operation was blocked on it.
    #[error("operation timed out after {elapsed:?} [{code}]")]
    Timeout { code: i32, elapsed: Duration },

    #[error("connect to {endpoint} timed out after {timeout:?} [{code}]")]
    ConnectTimeout {
        endpoint: String,
        code: i32,
        timeout: Duration,
    },

    #[error("token check failed, the peer is not trusted")]
    TokenMismatch,

    #[error("opcode mismatch: expected {expected}, received {received}")]
    OpcodeMismatch { expected: i32, received: i32 },

    #[error("length check failed: sent {sent} bytes, peer acknowledged {acknowledged}")]
    LengthMismatch { sent: i64, acknowledged: i64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An in-band failure reported by the peer application (e.g. a missing file).
    #[error("{message}")]
    Application { code: i32, message: String },

    #[error("login rejected: {0}")]
    Login(LoginStatus),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl LinkError {
    /// Returns the numeric code carried alongside the failure message.
    pub fn code(&self) -> i32 {
        match self {
            LinkError::Connection { code, .. }
            | LinkError::RemoteClosed { code }
            | LinkError::Timeout { code, .. }
            | LinkError::ConnectTimeout { code, .. }
            | LinkError::Application { code, .. } => *code,
            LinkError::SocketClosed => codes::SOCKET_CLOSED,
            LinkError::Io(_) => codes::PROTOCOL,
            LinkError::TokenMismatch => codes::TOKEN_MISMATCH,
            LinkError::OpcodeMismatch { .. } => codes::OPCODE_MISMATCH,
            LinkError::LengthMismatch { .. } => codes::LENGTH_MISMATCH,
            LinkError::Protocol(_) => codes::PROTOCOL,
            LinkError::Login(_) => codes::LOGIN_REJECTED,
            LinkError::IncompleteData => codes::INCOMPLETE,
            LinkError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            LinkError::Unsupported(_) => codes::UNSUPPORTED,
        }
    }

    /// True when the failure invalidates the socket it happened on.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LinkError::Connection { .. }
                | LinkError::RemoteClosed { .. }
                | LinkError::SocketClosed
                | LinkError::Io(_)
                | LinkError::Timeout { .. }
                | LinkError::ConnectTimeout { .. }
        )
    }

    /// True for the graceful peer-shutdown case.
    pub fn is_remote_closed(&self) -> bool {
        matches!(self, LinkError::RemoteClosed { .. })
    }
}

impl PartialEq for LinkError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LinkError::Io(e1), LinkError::Io(e2)) => e1.to_string() == e2.to_string(),
            (
                LinkError::Connection { code: c1, message: m1 },
                LinkError::Connection { code: c2, message: m2 },
            ) => c1 == c2 && m1 == m2,
            (LinkError::RemoteClosed { code: c1 }, LinkError::RemoteClosed { code: c2 }) => {
                c1 == c2
            }
            (
                LinkError::OpcodeMismatch { expected: e1, received: r1 },
                LinkError::OpcodeMismatch { expected: e2, received: r2 },
            ) => e1 == e2 && r1 == r2,
            (
                LinkError::LengthMismatch { sent: s1, acknowledged: a1 },
                LinkError::LengthMismatch { sent: s2, acknowledged: a2 },
            ) => s1 == s2 && a1 == a2,
            (LinkError::Protocol(s1), LinkError::Protocol(s2)) => s1 == s2,
            (
                LinkError::Application { code: c1, message: m1 },
                LinkError::Application { code: c2, message: m2 },
            ) => c1 == c2 && m1 == m2,
            (LinkError::Login(s1), LinkError::Login(s2)) => s1 == s2,
            (LinkError::InvalidArgument(s1), LinkError::InvalidArgument(s2)) => s1 == s2,
            (LinkError::Unsupported(s1), LinkError::Unsupported(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

/// The uniform result type of every transport operation.
pub type LinkResult<T> = Result<T, LinkError>;

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for LinkError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        LinkError::Protocol(format!("invalid utf-8 payload: {e}"))
    }
}

impl From<std::string::FromUtf16Error> for LinkError {
    fn from(e: std::string::FromUtf16Error) -> Self {
        LinkError::Protocol(format!("invalid utf-16 payload: {e}"))
    }
}

impl From<std::num::ParseIntError> for LinkError {
    fn from(e: std::num::ParseIntError) -> Self {
        LinkError::Protocol(format!("invalid decimal field: {e}"))
    }
}
