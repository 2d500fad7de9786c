// src/core/mod.rs

//! The transport core: errors, the timeout watchdog, socket primitives and the
//! wire codecs that ride on top of them.

pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod transport;
pub mod watchdog;

pub use errors::{LinkError, LinkResult};
pub use transport::{
    AnyStream, LinkSocket, ManagedSocket, MessageDescriptor, SocketCloser, Transport,
};
pub use watchdog::TimeoutWatchdog;
