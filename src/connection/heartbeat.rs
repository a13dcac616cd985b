//! Heartbeat supervision
//!
//! A periodic sweep evicts connections that stayed silent for longer than
//! [`HEARTBEAT_MISS_MULTIPLIER`] heartbeat intervals. Eviction goes through
//! the normal close path, so the reader task still fires disconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::conn::Conn;
use super::manager::ConnectionManager;
use crate::metrics::METRICS;

/// Missed intervals tolerated before a connection is evicted
pub const HEARTBEAT_MISS_MULTIPLIER: u32 = 2;

impl ConnectionManager {
    /// Close every connection idle for longer than `threshold`
    pub fn evict_idle(&self, threshold: Duration) -> usize {
        // Snapshot first; closing must not run under registry locks.
        let idle: Vec<Conn> = self
            .connections()
            .into_iter()
            .filter(|conn| conn.is_open() && conn.idle_duration() > threshold)
            .collect();

        for conn in &idle {
            info!(
                conn_id = %conn.conn_id(),
                idle_ms = conn.idle_duration().as_millis() as u64,
                "Evicting idle connection"
            );
            METRICS.heartbeat_evicted();
            let _ = conn.close();
        }

        idle.len()
    }

    /// Start the sweep task if a heartbeat interval is configured
    pub(crate) fn start_heartbeat(self: &Arc<Self>) -> bool {
        let Some(interval) = self.config.heartbeat_interval else {
            return false;
        };

        let threshold = interval * HEARTBEAT_MISS_MULTIPLIER;
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let evicted = manager.evict_idle(threshold);
                if evicted > 0 {
                    debug!(evicted, "Heartbeat sweep");
                }
            }
        });

        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
        debug!(interval_ms = interval.as_millis() as u64, "Heartbeat supervision started");
        true
    }

    pub(crate) fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}
