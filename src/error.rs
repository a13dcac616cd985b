//! Error types
//!
//! Connection-local failures never escape as server errors; they end up in
//! the disconnect path. Only bind, accept, dial and config failures are
//! fatal.

use std::io;

use thiserror::Error;

use crate::server::ServerState;

/// Library result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the public API
#[derive(Debug, Error)]
pub enum Error {
    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Listener could not be closed cleanly
    #[error("failed to close listener: {0}")]
    Close(#[source] io::Error),

    /// Accept loop ended on a non-transient error and the server stopped
    #[error("accept loop failed: {0}")]
    Accept(#[source] io::Error),

    /// Outbound session could not be established
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Registry is at the configured maximum
    #[error("connection limit reached ({max})")]
    CapacityExceeded { max: usize },

    /// Manager is draining or drained
    #[error("connection manager is closed")]
    ManagerClosed,

    /// Operation on a connection that is closing or closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// Write to the underlying session failed
    #[error("push failed: {0}")]
    Push(#[source] SessionError),

    /// Options could not be built
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Lifecycle call made in the wrong state
    #[error("cannot {op} while server is {state:?}")]
    InvalidState { op: &'static str, state: ServerState },
}

/// Option building failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cipher key derivation or construction failed
    #[error("cipher construction failed: {0}")]
    Cipher(String),

    /// A setting has an unusable value
    #[error("invalid option `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Errors raised by a raw transport session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session was closed locally or by the peer
    #[error("session closed")]
    Closed,

    /// Payload exceeds the configured maximum message length
    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// Packet failed to decrypt or authenticate
    #[error("cipher failure")]
    Cipher,

    /// Peer sent something that is not a valid packet
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether the error only reports an orderly close
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}
