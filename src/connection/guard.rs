// src/connection/guard.rs

//! Defines `ExchangeGuard`, an RAII guard that keeps a connection's error flag
//! honest when a request/response exchange is abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Marks the connection in-error on drop unless the exchange completed. An
/// exchange future dropped mid-flight (e.g. by a caller-side `select!`) may
/// have left half a request on the wire.
pub(crate) struct ExchangeGuard<'a> {
    in_error: &'a AtomicBool,
    connection_id: &'a str,
    completed: bool,
}

impl<'a> ExchangeGuard<'a> {
    pub(crate) fn new(in_error: &'a AtomicBool, connection_id: &'a str) -> Self {
        Self {
            in_error,
            connection_id,
            completed: false,
        }
    }

    /// Records the outcome. A failure marks the connection in-error.
    pub(crate) fn complete(mut self, success: bool) {
        self.completed = true;
        if !success {
            self.in_error.store(true, Ordering::Release);
        }
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        debug!(
            "Exchange on connection {} was abandoned, forcing a reconnect.",
            self.connection_id
        );
        self.in_error.store(true, Ordering::Release);
    }
}
