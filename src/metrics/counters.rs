//! Atomic counters for hot-path metrics
//!
//! Lock-free counters that can be safely updated from any task.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

/// Atomic metrics counters
pub struct Metrics {
    // Connection metrics
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub heartbeat_evictions: AtomicU64,

    // Traffic metrics
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub heartbeats_received: AtomicU64,

    // Error metrics
    pub accept_errors: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub push_errors: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            heartbeat_evictions: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            push_errors: AtomicU64::new(0),
        }
    }

    // Connection tracking
    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn heartbeat_evicted(&self) {
        self.heartbeat_evictions.fetch_add(1, Ordering::Relaxed);
    }

    // Traffic tracking
    #[inline]
    pub fn bytes_rx(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_tx(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn heartbeat_rx(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    #[inline]
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn push_error(&self) {
        self.push_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            heartbeat_evictions: self.heartbeat_evictions.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            push_errors: self.push_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub heartbeat_evictions: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub heartbeats_received: u64,
    pub accept_errors: u64,
    pub handshake_failures: u64,
    pub push_errors: u64,
}
