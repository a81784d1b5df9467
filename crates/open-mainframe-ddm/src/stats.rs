//! Server-wide counters shared by all connection tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free server statistics.
#[derive(Debug)]
pub struct ServerStats {
    /// Connections accepted since start
    pub connections_accepted: AtomicU64,
    /// Connections currently open
    pub connections_active: AtomicU64,
    /// Request chains processed
    pub chains_processed: AtomicU64,
    /// Commands that ended in an error reply
    pub command_errors: AtomicU64,
    /// Connections dropped for malformed input
    pub syntax_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    start_time: Instant,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            chains_processed: AtomicU64::new(0),
            command_errors: AtomicU64::new(0),
            syntax_errors: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_connect(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection and the bytes it moved.
    pub fn record_disconnect(&self, bytes_received: u64, bytes_sent: u64) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
    }

    pub fn record_chain(&self) {
        self.chains_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_error(&self) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_syntax_error(&self) {
        self.syntax_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            chains_processed: self.chains_processed.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            syntax_errors: self.syntax_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }
}

/// Copy of [`ServerStats`] at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub chains_processed: u64,
    pub command_errors: u64,
    pub syntax_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime: Duration,
}
