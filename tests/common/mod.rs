//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gatenet::transport::memory::MemoryTransport;
use gatenet::transport::{ClientTls, QuicConfig, QuicTransport};
use gatenet::{Client, ClientOptions, Server, ServerOptions};

/// Poll `cond` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Ordered log of hook invocations
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Server on the in-memory transport with every hook recorded
pub fn memory_server(transport: &MemoryTransport, options: ServerOptions, log: &EventLog) -> Server {
    let mut server = Server::with_transport(Arc::new(options), Arc::new(transport.clone()));

    let events = log.clone();
    server.on_start(move || events.push("start"));
    let events = log.clone();
    server.on_stop(move || events.push("stop"));
    let events = log.clone();
    server.on_connect(move |conn| events.push(format!("connect {}", conn.id())));
    let events = log.clone();
    server.on_disconnect(move |conn| events.push(format!("disconnect {}", conn.id())));
    let events = log.clone();
    server.on_receive(move |conn, payload, _| {
        events.push(format!("receive {} {}", conn.id(), payload.len()))
    });

    server
}

pub fn memory_client(transport: &MemoryTransport, options: ClientOptions) -> Client {
    Client::with_transport(Arc::new(options), Arc::new(transport.clone()))
}

/// QUIC transport with a self-signed server certificate and an
/// unverifying client
pub fn quic_transport() -> Arc<QuicTransport> {
    Arc::new(QuicTransport::new(QuicConfig {
        server: Default::default(),
        client: ClientTls {
            insecure: true,
            ..Default::default()
        },
    }))
}
