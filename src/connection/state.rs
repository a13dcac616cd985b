//! Connection identity and lifecycle state

use serde::Serialize;

/// Unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Create from raw u64
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle state, only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ConnState {
    /// Reading and writing
    Open = 0,
    /// Close requested, reader not yet exited
    Closing = 1,
    /// Reader exited and the connection left the registry
    Closed = 2,
}

impl ConnState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Open,
            1 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Serializable connection information
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    /// Peer IP:port, when the transport reports one
    pub remote_addr: Option<String>,
    pub state: ConnState,
    pub duration_secs: f64,
    pub idle_secs: f64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}
