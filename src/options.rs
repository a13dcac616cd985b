//! Server and client options
//!
//! Options are resolved once: a builder starts from compiled-in defaults,
//! applies overrides in call order and `build()` freezes the result. Nothing
//! mutates an options snapshot afterwards; servers and clients share it
//! behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::cipher::{BlockCrypt, CipherKind};
use crate::error::{ConfigError, Error};

pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:3553";
pub const DEFAULT_CLIENT_ADDR: &str = "127.0.0.1:3553";
pub const DEFAULT_MAX_MSG_LEN: usize = 1024;
pub const DEFAULT_MAX_CONN_NUM: usize = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Forward-error-correction shard counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Shards {
    #[serde(default)]
    pub data: usize,
    #[serde(default)]
    pub parity: usize,
}

impl Shards {
    /// Whether any redundancy was requested
    pub fn is_enabled(&self) -> bool {
        self.data > 0 || self.parity > 0
    }
}

/// Low-level retransmission and acknowledgement knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Acknowledge immediately instead of batching
    pub ack_no_delay: bool,
    /// Non-zero enables low-latency sending
    pub no_delay: u32,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Out-of-order count that triggers fast retransmission (0 = transport default)
    pub resend: u32,
    /// Non-zero relaxes congestion control
    pub nc: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            ack_no_delay: false,
            no_delay: 1,
            interval: 10,
            resend: 2,
            nc: 1,
        }
    }
}

/// Cipher request recorded by a builder, resolved at `build()`
#[derive(Clone)]
struct CipherSpec {
    kind: CipherKind,
    key: String,
    salt: String,
}

impl std::fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSpec").field("kind", &self.kind).finish_non_exhaustive()
    }
}

fn resolve_cipher(spec: Option<CipherSpec>) -> Result<Option<Arc<BlockCrypt>>, ConfigError> {
    match spec {
        None => Ok(None),
        Some(spec) if spec.kind == CipherKind::None => Ok(None),
        Some(spec) => BlockCrypt::new(spec.kind, &spec.key, &spec.salt).map(|c| Some(Arc::new(c))),
    }
}

fn check_common(max_msg_len: usize, heartbeat: bool, interval: Duration) -> Result<(), ConfigError> {
    if max_msg_len == 0 {
        return Err(ConfigError::Invalid {
            field: "max_msg_len",
            reason: "must be > 0",
        });
    }
    if heartbeat && interval.is_zero() {
        return Err(ConfigError::Invalid {
            field: "heartbeat_interval",
            reason: "must be > 0 when heartbeat is enabled",
        });
    }
    Ok(())
}

/// Immutable server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Listen address
    pub addr: String,
    /// Maximum payload length of one message
    pub max_msg_len: usize,
    /// Maximum number of live connections
    pub max_conn_num: usize,
    /// Evict idle connections
    pub heartbeat_check: bool,
    /// Sweep interval; eviction threshold is a multiple of it
    pub heartbeat_interval: Duration,
    /// Packet cipher, `None` for plaintext
    pub cipher: Option<Arc<BlockCrypt>>,
    pub shards: Shards,
    pub tuning: Tuning,
}

impl ServerOptions {
    /// Start a builder from the compiled-in defaults
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder::default()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            max_conn_num: DEFAULT_MAX_CONN_NUM,
            heartbeat_check: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cipher: None,
            shards: Shards::default(),
            tuning: Tuning::default(),
        }
    }
}

/// Builder for [`ServerOptions`]
#[derive(Debug, Default)]
pub struct ServerOptionsBuilder {
    opts: ServerOptions,
    cipher: Option<CipherSpec>,
}

impl ServerOptionsBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.opts.addr = addr.into();
        self
    }

    pub fn max_msg_len(mut self, len: usize) -> Self {
        self.opts.max_msg_len = len;
        self
    }

    pub fn max_conn_num(mut self, num: usize) -> Self {
        self.opts.max_conn_num = num;
        self
    }

    pub fn heartbeat_check(mut self, enable: bool) -> Self {
        self.opts.heartbeat_check = enable;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.opts.heartbeat_interval = interval;
        self
    }

    /// Select a packet cipher keyed from `key` and `salt`
    pub fn block_crypt(mut self, kind: CipherKind, key: impl Into<String>, salt: impl Into<String>) -> Self {
        self.cipher = Some(CipherSpec {
            kind,
            key: key.into(),
            salt: salt.into(),
        });
        self
    }

    pub fn shards(mut self, data: usize, parity: usize) -> Self {
        self.opts.shards = Shards { data, parity };
        self
    }

    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.opts.tuning = tuning;
        self
    }

    /// Freeze the options, deriving the cipher key if one was requested.
    ///
    /// Failures are reported as [`Error::Config`].
    pub fn build(mut self) -> Result<ServerOptions, Error> {
        check_common(
            self.opts.max_msg_len,
            self.opts.heartbeat_check,
            self.opts.heartbeat_interval,
        )?;
        if self.opts.max_conn_num == 0 {
            return Err(ConfigError::Invalid {
                field: "max_conn_num",
                reason: "must be > 0",
            }
            .into());
        }
        self.opts.cipher = resolve_cipher(self.cipher)?;
        Ok(self.opts)
    }
}

/// Immutable client options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Dial address
    pub addr: String,
    /// Maximum payload length of one message
    pub max_msg_len: usize,
    /// Send heartbeat packets while connected
    pub heartbeat: bool,
    pub heartbeat_interval: Duration,
    pub cipher: Option<Arc<BlockCrypt>>,
    pub shards: Shards,
    pub tuning: Tuning,
}

impl ClientOptions {
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: DEFAULT_CLIENT_ADDR.to_string(),
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            heartbeat: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cipher: None,
            shards: Shards::default(),
            tuning: Tuning::default(),
        }
    }
}

/// Builder for [`ClientOptions`]
#[derive(Debug, Default)]
pub struct ClientOptionsBuilder {
    opts: ClientOptions,
    cipher: Option<CipherSpec>,
}

impl ClientOptionsBuilder {
    pub fn dial_addr(mut self, addr: impl Into<String>) -> Self {
        self.opts.addr = addr.into();
        self
    }

    pub fn max_msg_len(mut self, len: usize) -> Self {
        self.opts.max_msg_len = len;
        self
    }

    pub fn heartbeat(mut self, enable: bool) -> Self {
        self.opts.heartbeat = enable;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.opts.heartbeat_interval = interval;
        self
    }

    pub fn block_crypt(mut self, kind: CipherKind, key: impl Into<String>, salt: impl Into<String>) -> Self {
        self.cipher = Some(CipherSpec {
            kind,
            key: key.into(),
            salt: salt.into(),
        });
        self
    }

    pub fn shards(mut self, data: usize, parity: usize) -> Self {
        self.opts.shards = Shards { data, parity };
        self
    }

    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.opts.tuning = tuning;
        self
    }

    pub fn build(mut self) -> Result<ClientOptions, Error> {
        check_common(
            self.opts.max_msg_len,
            self.opts.heartbeat,
            self.opts.heartbeat_interval,
        )?;
        self.opts.cipher = resolve_cipher(self.cipher)?;
        Ok(self.opts)
    }
}
