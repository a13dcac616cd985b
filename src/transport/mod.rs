//! Transport boundary
//!
//! The connection layer only sees these traits: a listener that yields raw
//! sessions, and sessions that read and write whole packets. The shipped
//! implementation is QUIC; tests plug in in-memory transports.

mod frame;
pub mod memory;
mod quic;
mod tls;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cipher::BlockCrypt;
use crate::error::SessionError;
use crate::options::{ClientOptions, ServerOptions, Shards, Tuning};

pub use frame::{FrameCodec, FRAME_HEADER_LEN};
pub use quic::{QuicConfig, QuicTransport};
pub use tls::{ClientTls, ServerTls};

/// Payload type carried by a data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    Binary,
}

/// One unit read from or written to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Liveness signal, never delivered to receive hooks
    Heartbeat,
    Data { msg_type: MessageType, payload: Bytes },
}

impl Packet {
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Packet::Data {
            msg_type: MessageType::Binary,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Packet::Data {
            msg_type: MessageType::Text,
            payload: payload.into(),
        }
    }

    /// Payload length, zero for heartbeats
    pub fn len(&self) -> usize {
        match self {
            Packet::Heartbeat => 0,
            Packet::Data { payload, .. } => payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a transport needs to bind or dial
#[derive(Debug, Clone)]
pub struct EndpointParams {
    pub addr: String,
    pub max_msg_len: usize,
    pub cipher: Option<Arc<BlockCrypt>>,
    pub shards: Shards,
    pub tuning: Tuning,
}

impl From<&ServerOptions> for EndpointParams {
    fn from(opts: &ServerOptions) -> Self {
        Self {
            addr: opts.addr.clone(),
            max_msg_len: opts.max_msg_len,
            cipher: opts.cipher.clone(),
            shards: opts.shards,
            tuning: opts.tuning,
        }
    }
}

impl From<&ClientOptions> for EndpointParams {
    fn from(opts: &ClientOptions) -> Self {
        Self {
            addr: opts.addr.clone(),
            max_msg_len: opts.max_msg_len,
            cipher: opts.cipher.clone(),
            shards: opts.shards,
            tuning: opts.tuning,
        }
    }
}

/// Accept failure classification used by the accept loop
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// Temporary condition; retry after backoff
    #[error("transient accept error: {0}")]
    Transient(#[source] io::Error),
    /// Listener was closed
    #[error("listener closed")]
    Closed,
    /// Listener is unusable
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),
}

impl AcceptError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AcceptError::Transient(_))
    }
}

/// One raw transport connection
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Peer address, when the transport has one
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Block until the next packet arrives
    async fn read(&self) -> Result<Packet, SessionError>;

    /// Write one packet
    async fn write(&self, packet: Packet) -> Result<(), SessionError>;

    /// Close the session; pending and future reads fail. Idempotent.
    fn close(&self);

    /// Apply per-session retransmission tuning
    fn apply_tuning(&self, _tuning: &Tuning) -> io::Result<()> {
        Ok(())
    }
}

/// Source of inbound sessions
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Block until the next session is ready
    async fn accept(&self) -> Result<Box<dyn Session>, AcceptError>;

    /// Stop accepting; pending and future accepts return [`AcceptError::Closed`]
    fn close(&self) -> io::Result<()>;
}

/// Factory for listeners and outbound sessions
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Protocol name reported by servers
    fn protocol(&self) -> &'static str;

    async fn listen(&self, params: &EndpointParams) -> io::Result<Box<dyn Listener>>;

    async fn dial(&self, params: &EndpointParams) -> io::Result<Box<dyn Session>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_len() {
        assert_eq!(Packet::Heartbeat.len(), 0);
        assert!(Packet::Heartbeat.is_empty());
        assert_eq!(Packet::binary(&b"abc"[..]).len(), 3);
    }

    #[test]
    fn test_accept_error_classification() {
        let transient = AcceptError::Transient(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(transient.is_transient());
        assert!(!AcceptError::Closed.is_transient());
        assert!(!AcceptError::Fatal(io::Error::from(io::ErrorKind::Other)).is_transient());
    }
}
