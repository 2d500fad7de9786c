// src/connection/mod.rs

//! Client-side connection lifecycle: reuse or reconnect policy, connect-time
//! handshakes and serialized request/response exchanges.

mod connector;
mod frame_transport;
mod guard;
mod handshake;
mod lifecycle;
mod options;

pub use connector::{Connector, TcpConnector};
pub use frame_transport::{FrameTransport, HslTransport, LengthPrefixedTransport};
pub use handshake::{AccountHandshake, HandshakeHook, NoHandshake};
pub use lifecycle::{Connection, FAST_FAILURE_WINDOW};
pub use options::ConnectionOptions;
