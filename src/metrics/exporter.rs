//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

use super::counters::{MetricsSnapshot, METRICS};
use crate::config::MetricsConfig;

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    describe_counter!("gatenet_connections_total", "Total connections admitted");
    describe_gauge!("gatenet_connections_active", "Currently registered connections");
    describe_counter!("gatenet_connections_rejected", "Sessions rejected at admission");
    describe_counter!("gatenet_heartbeat_evictions", "Connections closed by the heartbeat sweep");
    describe_counter!("gatenet_bytes_received", "Total payload bytes received");
    describe_counter!("gatenet_bytes_sent", "Total payload bytes pushed");
    describe_counter!("gatenet_packets_received", "Total data packets received");
    describe_counter!("gatenet_packets_sent", "Total data packets pushed");
    describe_counter!("gatenet_heartbeats_received", "Total heartbeat packets received");
    describe_counter!("gatenet_accept_errors", "Transient accept failures");
    describe_counter!("gatenet_handshake_failures", "Peer handshakes that failed or timed out");
    describe_counter!("gatenet_push_errors", "Failed pushes");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    tokio::spawn(sync_metrics_task());

    Ok(())
}

/// Periodically sync our atomic counters to the metrics crate
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last = MetricsSnapshot::default();

    loop {
        interval.tick().await;
        let snapshot = METRICS.snapshot();

        gauge!("gatenet_connections_active").set(snapshot.connections_active as f64);

        let deltas = [
            ("gatenet_connections_total", snapshot.connections_total, last.connections_total),
            ("gatenet_connections_rejected", snapshot.connections_rejected, last.connections_rejected),
            ("gatenet_heartbeat_evictions", snapshot.heartbeat_evictions, last.heartbeat_evictions),
            ("gatenet_bytes_received", snapshot.bytes_received, last.bytes_received),
            ("gatenet_bytes_sent", snapshot.bytes_sent, last.bytes_sent),
            ("gatenet_packets_received", snapshot.packets_received, last.packets_received),
            ("gatenet_packets_sent", snapshot.packets_sent, last.packets_sent),
            ("gatenet_heartbeats_received", snapshot.heartbeats_received, last.heartbeats_received),
            ("gatenet_accept_errors", snapshot.accept_errors, last.accept_errors),
            ("gatenet_handshake_failures", snapshot.handshake_failures, last.handshake_failures),
            ("gatenet_push_errors", snapshot.push_errors, last.push_errors),
        ];
        for (name, now, before) in deltas {
            let delta = now.saturating_sub(before);
            if delta > 0 {
                counter!(name).increment(delta);
            }
        }

        last = snapshot;
    }
}
