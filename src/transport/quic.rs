//! QUIC transport
//!
//! Each session is one QUIC connection carrying a single bidirectional
//! stream of framed packets. The dialing side opens the stream and writes a
//! heartbeat so the listener observes it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{Connection, Endpoint, Incoming, RecvStream, SendStream, TransportConfig, VarInt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::frame::FrameCodec;
use super::tls::{self, ClientTls, ServerTls};
use super::{AcceptError, EndpointParams, Listener, Packet, Session, Transport};
use crate::error::SessionError;
use crate::metrics::METRICS;
use crate::options::Tuning;

/// Time allowed for a peer to finish the handshake and open its stream
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting for `accept`
const ACCEPT_BACKLOG: usize = 128;

/// QUIC-level idle timeout; application heartbeats are separate
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// QUIC keep-alive sent by dialers
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// RFC 5681 lower bound for the reordering threshold
const MIN_PACKET_THRESHOLD: u32 = 3;

/// TLS settings for both roles
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuicConfig {
    #[serde(default)]
    pub server: ServerTls,
    #[serde(default)]
    pub client: ClientTls,
}

/// QUIC implementation of [`Transport`]
#[derive(Debug, Clone, Default)]
pub struct QuicTransport {
    config: QuicConfig,
}

impl QuicTransport {
    pub fn new(config: QuicConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn protocol(&self) -> &'static str {
        "quic"
    }

    async fn listen(&self, params: &EndpointParams) -> io::Result<Box<dyn Listener>> {
        let listener = QuicListener::bind(&self.config.server, params).await?;
        Ok(Box::new(listener))
    }

    async fn dial(&self, params: &EndpointParams) -> io::Result<Box<dyn Session>> {
        let session = dial(&self.config.client, params).await?;
        Ok(Box::new(session))
    }
}

/// Build the QUIC transport parameters from the tuning knobs
fn transport_config(params: &EndpointParams) -> TransportConfig {
    if params.shards.is_enabled() {
        warn!(
            data = params.shards.data,
            parity = params.shards.parity,
            "QUIC has no forward error correction, shard settings ignored"
        );
    }

    let Tuning {
        ack_no_delay,
        no_delay,
        interval,
        resend,
        nc,
    } = params.tuning;

    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport.datagram_receive_buffer_size(None);

    if let Ok(timeout) = IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(timeout));
    }
    if no_delay > 0 && interval > 0 {
        transport.initial_rtt(Duration::from_millis(u64::from(interval)));
    }
    if resend > 0 {
        transport.packet_threshold(resend.max(MIN_PACKET_THRESHOLD));
    }
    if nc > 0 {
        transport.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
    }
    if ack_no_delay {
        let mut ack = quinn::AckFrequencyConfig::default();
        ack.max_ack_delay(Some(Duration::ZERO));
        transport.ack_frequency_config(Some(ack));
    }

    transport
}

/// Resolve `host:port`, preferring a literal socket address
async fn resolve_address(address: &str) -> io::Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {address}")))
}

/// Listening QUIC endpoint
pub struct QuicListener {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    ready: Mutex<mpsc::Receiver<QuicSession>>,
    closed: watch::Sender<bool>,
}

impl QuicListener {
    async fn bind(tls: &ServerTls, params: &EndpointParams) -> io::Result<Self> {
        let addr = resolve_address(&params.addr).await?;

        let crypto = tls::server_crypto(tls).map_err(|e| io::Error::other(format!("{e:#}")))?;
        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto).map_err(io::Error::other)?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
        server_config.transport_config(Arc::new(transport_config(params)));

        let socket = crate::util::create_udp_socket(addr)?;
        let runtime = quinn::default_runtime()
            .ok_or_else(|| io::Error::other("no async runtime found"))?;
        let endpoint = Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(server_config),
            socket,
            runtime,
        )?;
        let local_addr = endpoint.local_addr()?;

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (closed, closed_rx) = watch::channel(false);
        let codec = FrameCodec::new(params.max_msg_len, params.cipher.clone());
        tokio::spawn(run_handshakes(endpoint.clone(), codec, tx, closed_rx));

        info!(%local_addr, "QUIC listener bound");

        Ok(Self {
            endpoint,
            local_addr,
            ready: Mutex::new(rx),
            closed,
        })
    }
}

/// Drive handshakes off the accept path so a slow peer never stalls `accept`
async fn run_handshakes(
    endpoint: Endpoint,
    codec: FrameCodec,
    tx: mpsc::Sender<QuicSession>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let incoming = tokio::select! {
            incoming = endpoint.accept() => incoming,
            _ = closed.wait_for(|closed| *closed) => break,
        };
        let Some(incoming) = incoming else {
            break;
        };

        let tx = tx.clone();
        let codec = codec.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            let result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(incoming, codec)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")),
            };
            match result {
                // Receiver gone means the listener was dropped
                Ok(session) => {
                    let _ = tx.send(session).await;
                }
                // One peer failing never slows admission of the others
                Err(e) => {
                    METRICS.handshake_failed();
                    debug!(%remote, error = %e, "QUIC handshake failed");
                }
            }
        });
    }
    debug!("QUIC handshake loop stopped");
}

async fn handshake(incoming: Incoming, codec: FrameCodec) -> io::Result<QuicSession> {
    let remote = incoming.remote_address();
    let connection = incoming
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;
    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;

    debug!(%remote, "QUIC session stream opened");
    Ok(QuicSession::new(connection, send, recv, codec, None))
}

#[async_trait]
impl Listener for QuicListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn accept(&self) -> Result<Box<dyn Session>, AcceptError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(AcceptError::Closed);
        }

        let mut ready = self.ready.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(AcceptError::Closed),
            next = ready.recv() => match next {
                Some(session) => Ok(Box::new(session)),
                None => Err(AcceptError::Closed),
            },
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.endpoint.set_server_config(None);
        info!(local_addr = %self.local_addr, "QUIC listener closed");
        Ok(())
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
    }
}

async fn dial(tls: &ClientTls, params: &EndpointParams) -> io::Result<QuicSession> {
    let addr = resolve_address(&params.addr).await?;
    let bind_addr: SocketAddr = if addr.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };

    let crypto = tls::client_crypto(tls).map_err(|e| io::Error::other(format!("{e:#}")))?;
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(io::Error::other)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    let mut transport = transport_config(params);
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    client_config.transport_config(Arc::new(transport));

    let mut endpoint = Endpoint::client(bind_addr)?;
    endpoint.set_default_client_config(client_config);

    let server_name = tls
        .server_name
        .clone()
        .unwrap_or_else(|| server_name_from(&params.addr).to_string());

    debug!(%addr, name = %server_name, "Connecting to server");
    let connection = endpoint
        .connect(addr, &server_name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
    let (mut send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;

    let codec = FrameCodec::new(params.max_msg_len, params.cipher.clone());
    codec
        .write_packet(&mut send, &Packet::Heartbeat)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;

    info!(addr = %connection.remote_address(), "Connected to server");
    Ok(QuicSession::new(connection, send, recv, codec, Some(endpoint)))
}

/// Host part of `host:port`
fn server_name_from(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// One QUIC connection and its packet stream
pub struct QuicSession {
    connection: Connection,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    codec: FrameCodec,
    // Dialed sessions own their client endpoint
    _endpoint: Option<Endpoint>,
}

impl QuicSession {
    fn new(
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
        codec: FrameCodec,
        endpoint: Option<Endpoint>,
    ) -> Self {
        Self {
            connection,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            codec,
            _endpoint: endpoint,
        }
    }
}

#[async_trait]
impl Session for QuicSession {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }

    async fn read(&self) -> Result<Packet, SessionError> {
        let mut recv = self.recv.lock().await;
        self.codec.read_packet(&mut *recv).await
    }

    async fn write(&self, packet: Packet) -> Result<(), SessionError> {
        if self.connection.close_reason().is_some() {
            return Err(SessionError::Closed);
        }
        let mut send = self.send.lock().await;
        self.codec.write_packet(&mut *send, &packet).await
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }

    fn apply_tuning(&self, tuning: &Tuning) -> io::Result<()> {
        // Congestion and ack settings live in the endpoint's transport config
        debug!(
            remote = %self.connection.remote_address(),
            ?tuning,
            rtt_ms = self.connection.rtt().as_millis() as u64,
            "Session tuned by endpoint transport config"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_extraction() {
        assert_eq!(server_name_from("example.com:3553"), "example.com");
        assert_eq!(server_name_from("[::1]:3553"), "::1");
        assert_eq!(server_name_from("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve_address("127.0.0.1:3553").await.unwrap();
        assert_eq!(addr.port(), 3553);
    }
}
