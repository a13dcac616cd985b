//! Connection wrapper
//!
//! `Conn` is a cheap handle over one raw session. Clones share the session,
//! the state and the activity clock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::state::{ConnState, ConnectionId, ConnectionInfo};
use crate::error::{Error, Result, SessionError};
use crate::metrics::METRICS;
use crate::transport::{Packet, Session};

/// A managed connection
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    session: Box<dyn Session>,
    remote_addr: Option<SocketAddr>,
    state: AtomicU8,
    connected_at: Instant,
    last_active: Mutex<Instant>,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
}

impl Conn {
    pub(crate) fn new(id: ConnectionId, session: Box<dyn Session>) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                id,
                remote_addr: session.remote_addr(),
                session,
                state: AtomicU8::new(ConnState::Open as u8),
                connected_at: now,
                last_active: Mutex::new(now),
                bytes_rx: AtomicU64::new(0),
                bytes_tx: AtomicU64::new(0),
            }),
        }
    }

    /// Numeric connection ID
    pub fn id(&self) -> u64 {
        self.inner.id.as_u64()
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    /// Time of the last inbound packet
    pub fn last_active(&self) -> Instant {
        *self.inner.last_active.lock()
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// Send a binary message.
    ///
    /// There is no timeout: a stalled transport write blocks the caller
    /// until the transport's own flow control releases it.
    pub async fn push(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(Packet::binary(payload)).await
    }

    /// Send a text message
    pub async fn push_text(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(Packet::text(payload)).await
    }

    pub(crate) async fn send_heartbeat(&self) -> Result<()> {
        self.send(Packet::Heartbeat).await
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        let len = packet.len() as u64;
        let is_data = !matches!(packet, Packet::Heartbeat);
        match self.inner.session.write(packet).await {
            Ok(()) => {
                if is_data {
                    self.inner.bytes_tx.fetch_add(len, Ordering::Relaxed);
                    METRICS.bytes_tx(len);
                }
                Ok(())
            }
            Err(SessionError::Closed) => Err(Error::ConnectionClosed),
            Err(e) => {
                METRICS.push_error();
                Err(Error::Push(e))
            }
        }
    }

    /// Close the connection. Closing an already closing or closed
    /// connection is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.begin_close() {
            debug!(conn_id = %self.inner.id, "Closing connection");
            self.inner.session.close();
        }
        Ok(())
    }

    /// Open -> Closing; true only for the caller that made the transition
    pub(crate) fn begin_close(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnState::Open as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Close the raw session regardless of who started closing
    pub(crate) fn shutdown_session(&self) {
        self.begin_close();
        self.inner.session.close();
    }

    pub(crate) fn mark_closed(&self) {
        self.inner
            .state
            .store(ConnState::Closed as u8, Ordering::Release);
    }

    pub(crate) async fn read(&self) -> std::result::Result<Packet, SessionError> {
        self.inner.session.read().await
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_active.lock() = Instant::now();
    }

    pub(crate) fn record_rx(&self, bytes: usize) {
        self.touch();
        self.inner.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        METRICS.bytes_rx(bytes as u64);
    }

    /// Snapshot for listings
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id(),
            remote_addr: self.remote_addr().map(|a| a.to_string()),
            state: self.state(),
            duration_secs: self.inner.connected_at.elapsed().as_secs_f64(),
            idle_secs: self.idle_duration().as_secs_f64(),
            bytes_rx: self.inner.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.inner.bytes_tx.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::session_pair;

    #[tokio::test]
    async fn test_push_reaches_peer() {
        let (local, remote) = session_pair();
        let conn = Conn::new(ConnectionId(1), Box::new(local));

        conn.push(&b"abc"[..]).await.unwrap();
        assert_eq!(remote.read().await.unwrap(), Packet::binary(&b"abc"[..]));
        assert_eq!(conn.info().bytes_tx, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_push() {
        let (local, remote) = session_pair();
        let conn = Conn::new(ConnectionId(1), Box::new(local));

        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(matches!(conn.push(&b"x"[..]).await, Err(Error::ConnectionClosed)));
        assert!(remote.read().await.unwrap_err().is_closed());

        conn.mark_closed();
        conn.close().unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_only_first_close_transitions() {
        let (local, _remote) = session_pair();
        let conn = Conn::new(ConnectionId(1), Box::new(local));

        assert!(conn.begin_close());
        assert!(!conn.begin_close());
    }

    #[tokio::test]
    async fn test_rx_advances_last_active() {
        let (local, _remote) = session_pair();
        let conn = Conn::new(ConnectionId(1), Box::new(local));
        let before = conn.last_active();

        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.record_rx(3);

        assert!(conn.last_active() > before);
        assert_eq!(conn.info().bytes_rx, 3);
    }
}
