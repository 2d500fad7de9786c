// src/core/metrics.rs

//! Defines and registers Prometheus metrics for transport monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, TextEncoder, register_counter, register_gauge};

lazy_static! {
    // --- Gauges ---
    /// The number of sessions currently registered on servers in this process.
    pub static ref LIVE_SESSIONS: Gauge =
        register_gauge!("linkcore_live_sessions", "Number of currently registered sessions.").unwrap();

    // --- Counters ---
    /// The total number of connections accepted by session servers.
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: Counter =
        register_counter!("linkcore_connections_accepted_total", "Total number of accepted connections.").unwrap();
    /// Connections rejected by an extra check (login, account, DTU registration).
    pub static ref LOGINS_REJECTED_TOTAL: Counter =
        register_counter!("linkcore_logins_rejected_total", "Total number of connections rejected during login.").unwrap();
    /// Connection-level socket failures (connect, send, receive, remote close).
    pub static ref SOCKET_ERRORS_TOTAL: Counter =
        register_counter!("linkcore_socket_errors_total", "Total number of socket-level failures.").unwrap();
    /// Operations whose socket was force-closed by the watchdog.
    pub static ref WATCHDOG_EXPIRED_TOTAL: Counter =
        register_counter!("linkcore_watchdog_expired_total", "Total number of operations expired by the watchdog.").unwrap();
    /// Immediate reconnect attempts taken on the fast-failure path.
    pub static ref RECONNECT_RETRIES_TOTAL: Counter =
        register_counter!("linkcore_reconnect_retries_total", "Total number of immediate reconnect retries.").unwrap();
    pub static ref BYTES_SENT_TOTAL: Counter =
        register_counter!("linkcore_bytes_sent_total", "Total number of bytes sent.").unwrap();
    pub static ref BYTES_RECEIVED_TOTAL: Counter =
        register_counter!("linkcore_bytes_received_total", "Total number of bytes received.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
