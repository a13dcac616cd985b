//! Client side
//!
//! Dials one outbound session per `dial()` call and drives it with the same
//! reader used on the server, without a registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::connection::{run_reader, Conn, ConnectionId};
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::options::ClientOptions;
use crate::transport::{EndpointParams, MessageType, QuicTransport, Transport};

/// Outbound connection factory
pub struct Client {
    options: Arc<ClientOptions>,
    transport: Arc<dyn Transport>,
    hooks: Hooks,
    next_id: AtomicU64,
}

impl Client {
    /// Create a QUIC client that verifies against the webpki roots
    pub fn new(options: Arc<ClientOptions>) -> Self {
        Self::with_transport(options, Arc::new(QuicTransport::default()))
    }

    pub fn with_transport(options: Arc<ClientOptions>, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            transport,
            hooks: Hooks::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn on_connect(&mut self, handler: impl Fn(&Conn) + Send + Sync + 'static) {
        self.hooks.on_connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&mut self, handler: impl Fn(&Conn) + Send + Sync + 'static) {
        self.hooks.on_disconnect = Some(Arc::new(handler));
    }

    pub fn on_receive(&mut self, handler: impl Fn(&Conn, Bytes, MessageType) + Send + Sync + 'static) {
        self.hooks.on_receive = Some(Arc::new(handler));
    }

    /// Open a connection to the configured address.
    ///
    /// Hooks registered so far apply to this connection only; the hook set
    /// is copied here.
    pub async fn dial(&self) -> Result<Conn> {
        let params = EndpointParams::from(&*self.options);
        let session = self
            .transport
            .dial(&params)
            .await
            .map_err(|source| Error::Dial {
                addr: self.options.addr.clone(),
                source,
            })?;

        if let Err(e) = session.apply_tuning(&self.options.tuning) {
            debug!(error = %e, "Failed to apply session tuning");
        }

        let id = ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Conn::new(id, session);
        info!(
            conn_id = %id,
            addr = %self.options.addr,
            protocol = self.transport.protocol(),
            "Dialed"
        );

        let hooks = Arc::new(self.hooks.clone());
        tokio::spawn(run_reader(conn.clone(), hooks, |_conn: &Conn| {}));

        if self.options.heartbeat {
            tokio::spawn(send_heartbeats(conn.clone(), self.options.heartbeat_interval));
        }

        Ok(conn)
    }
}

/// Keep the server's idle clock fresh until the connection closes
async fn send_heartbeats(conn: Conn, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = conn.send_heartbeat().await {
            debug!(conn_id = %conn.conn_id(), error = %e, "Heartbeat sender stopped");
            break;
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.options.addr)
            .field("protocol", &self.transport.protocol())
            .field("hooks", &self.hooks)
            .finish()
    }
}
