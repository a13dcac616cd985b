//! Gatenet Server - Entry Point
//!
//! Echo server on top of the connection lifecycle layer: every message is
//! pushed back to the connection it came from.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info, warn};

use gatenet::transport::{MessageType, QuicTransport};
use gatenet::{Config, Server, VERSION};

/// Application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::default()
    };

    gatenet::util::init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        "Starting Gatenet Server"
    );

    if config.metrics.enabled {
        gatenet::metrics::init_metrics(&config.metrics)?;
        info!(
            bind_addr = %config.metrics.bind_addr,
            "Metrics endpoint started"
        );
    }

    let options = config
        .server_options()
        .context("Invalid server options")?;
    let transport = Arc::new(QuicTransport::new(config.tls.clone()));
    let mut server = Server::with_transport(Arc::new(options), transport);

    server.on_connect(|conn| {
        info!(conn_id = conn.id(), remote_addr = ?conn.remote_addr(), "Player connected");
    });
    server.on_disconnect(|conn| {
        info!(conn_id = conn.id(), "Player disconnected");
    });
    server.on_receive(|conn, payload, msg_type| {
        debug!(conn_id = conn.id(), len = payload.len(), ?msg_type, "Echo");
        let conn = conn.clone();
        tokio::spawn(async move {
            let result = match msg_type {
                MessageType::Text => conn.push_text(payload).await,
                MessageType::Binary => conn.push(payload).await,
            };
            if let Err(e) = result {
                warn!(conn_id = conn.id(), error = %e, "Echo failed");
            }
        });
    });

    server.start().await.context("Failed to start server")?;
    info!(
        addr = server.addr(),
        local_addr = ?server.local_addr(),
        protocol = server.protocol(),
        "Server listening"
    );

    shutdown_signal().await?;
    info!(
        connections = server.connection_count(),
        "Shutdown signal received, draining connections..."
    );

    if let Err(e) = server.stop().await {
        warn!(error = %e, "Server stopped with error");
    }

    info!("Server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.context("Failed to listen for Ctrl+C")?;

    Ok(())
}
