//! Gatenet - connection lifecycle layer for game servers
//!
//! Turns a raw transport into a managed population of addressable
//! connections with lifecycle hooks and heartbeat supervision. The shipped
//! transport is QUIC; anything implementing [`transport::Transport`] can be
//! plugged in.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gatenet::{Server, ServerOptions};
//!
//! # async fn run() -> gatenet::Result<()> {
//! let options = ServerOptions::builder()
//!     .listen_addr("0.0.0.0:3553")
//!     .heartbeat_check(true)
//!     .build()?;
//!
//! let mut server = Server::new(Arc::new(options));
//! server.on_receive(|conn, payload, _msg_type| {
//!     let conn = conn.clone();
//!     tokio::spawn(async move { conn.push(payload).await });
//! });
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod options;
pub mod server;
pub mod transport;
pub mod util;

pub use cipher::{BlockCrypt, CipherKind};
pub use client::Client;
pub use config::Config;
pub use connection::{Conn, ConnState, ConnectionId};
pub use error::{ConfigError, Error, Result, SessionError};
pub use options::{ClientOptions, ServerOptions, Shards, Tuning};
pub use server::{Server, ServerState};
pub use transport::MessageType;

/// Library version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
