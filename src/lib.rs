// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;

// Re-export
pub use crate::connection::{Connection, ConnectionOptions};
pub use crate::core::{LinkError, LinkResult, TimeoutWatchdog, Transport};
