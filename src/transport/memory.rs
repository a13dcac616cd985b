//! In-memory transport
//!
//! Channel-backed sessions and listeners keyed by address string. Useful
//! for exercising servers and clients without sockets, including accept
//! failures that are hard to provoke on a real network.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{AcceptError, EndpointParams, Listener, Packet, Session, Transport};
use crate::error::SessionError;
use crate::options::Tuning;

type AcceptItem = Result<Box<dyn Session>, AcceptError>;
type Registry = Arc<parking_lot::Mutex<HashMap<String, mpsc::UnboundedSender<AcceptItem>>>>;

/// One end of an in-memory session
pub struct MemorySession {
    tx: mpsc::UnboundedSender<Packet>,
    rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: Arc<watch::Sender<bool>>,
    tuned: AtomicBool,
}

/// Two connected session ends; closing either closes both
pub fn session_pair() -> (MemorySession, MemorySession) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);

    let a = MemorySession {
        tx: a_tx,
        rx: Mutex::new(b_rx),
        closed: closed.clone(),
        tuned: AtomicBool::new(false),
    };
    let b = MemorySession {
        tx: b_tx,
        rx: Mutex::new(a_rx),
        closed,
        tuned: AtomicBool::new(false),
    };
    (a, b)
}

impl MemorySession {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether tuning was applied to this end
    pub fn is_tuned(&self) -> bool {
        self.tuned.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn read(&self) -> Result<Packet, SessionError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(SessionError::Closed);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(SessionError::Closed),
            packet = rx.recv() => packet.ok_or(SessionError::Closed),
        }
    }

    async fn write(&self, packet: Packet) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.tx.send(packet).map_err(|_| SessionError::Closed)
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn apply_tuning(&self, _tuning: &Tuning) -> io::Result<()> {
        self.tuned.store(true, Ordering::Release);
        Ok(())
    }
}

/// In-memory [`Transport`]; clones share the same address space
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Registry,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an accept error for the listener bound at `addr`
    pub fn inject_accept_error(&self, addr: &str, err: AcceptError) -> bool {
        match self.listeners.lock().get(addr) {
            Some(tx) => tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Whether a listener is bound at `addr`
    pub fn is_listening(&self, addr: &str) -> bool {
        self.listeners.lock().contains_key(addr)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn protocol(&self) -> &'static str {
        "memory"
    }

    async fn listen(&self, params: &EndpointParams) -> io::Result<Box<dyn Listener>> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&params.addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", params.addr),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(params.addr.clone(), tx);
        let (closed, _) = watch::channel(false);

        Ok(Box::new(MemoryListener {
            addr: params.addr.clone(),
            incoming: Mutex::new(rx),
            closed,
            registry: self.listeners.clone(),
        }))
    }

    async fn dial(&self, params: &EndpointParams) -> io::Result<Box<dyn Session>> {
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening on {}", params.addr));

        let tx = self.listeners.lock().get(&params.addr).cloned().ok_or_else(refused)?;
        let (client, server) = session_pair();
        tx.send(Ok(Box::new(server))).map_err(|_| refused())?;

        Ok(Box::new(client))
    }
}

/// Listener half of [`MemoryTransport`]
pub struct MemoryListener {
    addr: String,
    incoming: Mutex<mpsc::UnboundedReceiver<AcceptItem>>,
    closed: watch::Sender<bool>,
    registry: Registry,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "memory listeners have no socket address",
        ))
    }

    async fn accept(&self) -> Result<Box<dyn Session>, AcceptError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(AcceptError::Closed);
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(AcceptError::Closed),
            item = incoming.recv() => item.unwrap_or(Err(AcceptError::Closed)),
        }
    }

    fn close(&self) -> io::Result<()> {
        // Only the first close owns the registry entry; the address may
        // have been rebound since.
        if !self.closed.send_replace(true) {
            self.registry.lock().remove(&self.addr);
        }
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let _ = Listener::close(self);
    }
}
