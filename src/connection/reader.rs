//! Per-connection read loop

use std::sync::Arc;

use tracing::debug;

use super::conn::Conn;
use crate::error::SessionError;
use crate::hooks::Hooks;
use crate::metrics::METRICS;
use crate::transport::Packet;

/// Drive one connection until its session fails or closes.
///
/// Fires connect, then receive for every data packet, then calls `release`
/// and finally disconnect. All hooks for the connection run on this task.
/// A panicking connect or receive hook closes the connection.
pub(crate) async fn run<F>(conn: Conn, hooks: Arc<Hooks>, release: F)
where
    F: FnOnce(&Conn),
{
    if !hooks.connect(&conn) {
        let _ = conn.close();
    }

    let reason = read_loop(&conn, &hooks).await;
    if reason.is_closed() {
        debug!(conn_id = %conn.conn_id(), "Session closed");
    } else {
        debug!(conn_id = %conn.conn_id(), error = %reason, "Session read failed");
    }

    release(&conn);
    conn.mark_closed();
    hooks.disconnect(&conn);
}

async fn read_loop(conn: &Conn, hooks: &Hooks) -> SessionError {
    loop {
        match conn.read().await {
            Ok(Packet::Heartbeat) => {
                conn.touch();
                METRICS.heartbeat_rx();
            }
            Ok(Packet::Data { msg_type, payload }) => {
                conn.record_rx(payload.len());
                if !hooks.receive(conn, payload, msg_type) {
                    let _ = conn.close();
                }
            }
            Err(e) => return e,
        }
    }
}
