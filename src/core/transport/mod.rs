// src/core/transport/mod.rs

//! Socket ownership, byte-level primitives and the message framing engine.

mod framing;
mod primitives;
mod socket;
mod stream;

pub use framing::{LengthPrefixedMessage, MAX_MESSAGE_CONTENT, MessageDescriptor};
pub use primitives::{
    ERROR_COUNTER_CAP, ErrorCounter, Progress, ProgressFn, ReadSize, SCRATCH_BUFFER_SIZE,
    Transport,
};
pub use socket::{LinkSocket, ManagedSocket, SocketCloser};
pub use stream::{AnyStream, AsyncStream};
