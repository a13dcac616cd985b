//! Configuration management
//!
//! Loads the binaries' TOML configuration and turns it into option
//! snapshots. Every section is optional; missing keys fall back to the
//! library defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::cipher::CipherKind;
use crate::error::Error;
use crate::options::{
    ClientOptions, ServerOptions, Shards, Tuning, DEFAULT_CLIENT_ADDR, DEFAULT_MAX_CONN_NUM,
    DEFAULT_MAX_MSG_LEN, DEFAULT_SERVER_ADDR,
};
use crate::transport::QuicConfig;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    /// `[tls.server]` and `[tls.client]`
    #[serde(default)]
    pub tls: QuicConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the listener
    #[serde(default = "default_server_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Evict connections that stop sending
    #[serde(default)]
    pub heartbeat_check: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_server_addr(),
            max_msg_len: default_max_msg_len(),
            max_connections: default_max_connections(),
            heartbeat_check: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Address to dial
    #[serde(default = "default_client_addr")]
    pub server_addr: String,
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: usize,
    /// Send heartbeats while connected
    #[serde(default)]
    pub heartbeat: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_client_addr(),
            max_msg_len: default_max_msg_len(),
            heartbeat: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Packet cipher configuration, shared by both roles
#[derive(Clone, Default, Deserialize)]
pub struct CipherConfig {
    #[serde(default)]
    pub kind: CipherKind,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub salt: String,
}

impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherConfig")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Transport knobs, shared by both roles
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub shards: Shards,
    #[serde(default)]
    pub tuning: Tuning,
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Metrics server bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_server_addr() -> String { DEFAULT_SERVER_ADDR.to_string() }
fn default_client_addr() -> String { DEFAULT_CLIENT_ADDR.to_string() }
fn default_max_msg_len() -> usize { DEFAULT_MAX_MSG_LEN }
fn default_max_connections() -> usize { DEFAULT_MAX_CONN_NUM }
fn default_heartbeat_interval() -> u64 { 10 }
fn default_metrics_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 9090)) }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&contents)
    }

    /// Parse and validate TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be > 0");
        }
        if self.server.max_msg_len == 0 || self.client.max_msg_len == 0 {
            anyhow::bail!("max_msg_len must be > 0");
        }
        if self.server.heartbeat_check && self.server.heartbeat_interval_secs == 0 {
            anyhow::bail!("server.heartbeat_interval_secs must be > 0 when heartbeat_check is on");
        }
        if self.client.heartbeat && self.client.heartbeat_interval_secs == 0 {
            anyhow::bail!("client.heartbeat_interval_secs must be > 0 when heartbeat is on");
        }
        if self.cipher.kind != CipherKind::None
            && (self.cipher.key.is_empty() || self.cipher.salt.is_empty())
        {
            anyhow::bail!("cipher.key and cipher.salt are required for cipher {}", self.cipher.kind);
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("logging.format must be \"json\" or \"pretty\"");
        }
        Ok(())
    }

    /// Build the server option snapshot
    pub fn server_options(&self) -> Result<ServerOptions, Error> {
        let server = &self.server;
        let mut builder = ServerOptions::builder()
            .listen_addr(server.bind_addr.clone())
            .max_msg_len(server.max_msg_len)
            .max_conn_num(server.max_connections)
            .heartbeat_check(server.heartbeat_check)
            .heartbeat_interval(Duration::from_secs(server.heartbeat_interval_secs))
            .shards(self.transport.shards.data, self.transport.shards.parity)
            .tuning(self.transport.tuning);
        if self.cipher.kind != CipherKind::None {
            builder = builder.block_crypt(
                self.cipher.kind,
                self.cipher.key.clone(),
                self.cipher.salt.clone(),
            );
        }
        builder.build()
    }

    /// Build the client option snapshot
    pub fn client_options(&self) -> Result<ClientOptions, Error> {
        let client = &self.client;
        let mut builder = ClientOptions::builder()
            .dial_addr(client.server_addr.clone())
            .max_msg_len(client.max_msg_len)
            .heartbeat(client.heartbeat)
            .heartbeat_interval(Duration::from_secs(client.heartbeat_interval_secs))
            .shards(self.transport.shards.data, self.transport.shards.parity)
            .tuning(self.transport.tuning);
        if self.cipher.kind != CipherKind::None {
            builder = builder.block_crypt(
                self.cipher.kind,
                self.cipher.key.clone(),
                self.cipher.salt.clone(),
            );
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.bind_addr, DEFAULT_SERVER_ADDR);
        assert_eq!(config.client.server_addr, DEFAULT_CLIENT_ADDR);
        assert!(!config.metrics.enabled);
        assert!(config.tls.server.auto_generate);

        let opts = config.server_options().unwrap();
        assert_eq!(opts.max_conn_num, DEFAULT_MAX_CONN_NUM);
        assert!(opts.cipher.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [server]
            bind_addr = "127.0.0.1:4000"
            max_connections = 2
            heartbeat_check = true
            heartbeat_interval_secs = 5

            [client]
            server_addr = "127.0.0.1:4000"
            heartbeat = true

            [cipher]
            kind = "aes128"
            key = "secret"
            salt = "pepper"

            [transport.shards]
            data = 10
            parity = 3

            [transport.tuning]
            ack_no_delay = true
            resend = 0

            [tls.client]
            insecure = true

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let server = config.server_options().unwrap();
        assert_eq!(server.addr, "127.0.0.1:4000");
        assert_eq!(server.max_conn_num, 2);
        assert!(server.heartbeat_check);
        assert_eq!(server.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(server.shards, Shards { data: 10, parity: 3 });
        assert!(server.tuning.ack_no_delay);
        assert_eq!(server.tuning.resend, 0);
        assert_eq!(server.tuning.interval, Tuning::default().interval);
        assert_eq!(server.cipher.as_ref().map(|c| c.kind()), Some(CipherKind::Aes128));

        let client = config.client_options().unwrap();
        assert!(client.heartbeat);
        assert!(client.cipher.is_some());
        assert!(config.tls.client.insecure);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::parse("[server]\nmax_connections = 0").is_err());
        assert!(Config::parse("[cipher]\nkind = \"chacha20\"").is_err());
        assert!(Config::parse("[logging]\nformat = \"xml\"").is_err());
        assert!(Config::parse("[client]\nheartbeat = true\nheartbeat_interval_secs = 0").is_err());
    }
}
