//! Server lifecycle
//!
//! Binds the listener, runs the accept loop and drains connections on stop.

use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use bytes::Bytes;

use super::acceptor::accept_loop;
use super::ServerState;
use crate::connection::{Conn, ConnectionId, ConnectionManager, ConnectionManagerConfig};
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::options::{ServerOptions, Tuning};
use crate::transport::{EndpointParams, Listener, MessageType, QuicTransport, Transport};

/// Connection-lifecycle server
pub struct Server {
    options: Arc<ServerOptions>,
    transport: Arc<dyn Transport>,
    hooks: Hooks,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

struct Lifecycle {
    state: ServerState,
    run: Option<Running>,
    // Set when the accept loop stopped the server on its own
    failure: Option<io::Error>,
}

/// Resources owned by one start/stop cycle
struct Running {
    listener: Arc<dyn Listener>,
    local_addr: Option<SocketAddr>,
    manager: Arc<ConnectionManager>,
    hooks: Arc<Hooks>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Create a QUIC server with a self-signed certificate
    pub fn new(options: Arc<ServerOptions>) -> Self {
        Self::with_transport(options, Arc::new(QuicTransport::default()))
    }

    pub fn with_transport(options: Arc<ServerOptions>, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            transport,
            hooks: Hooks::default(),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                run: None,
                failure: None,
            })),
        }
    }

    /// Configured listen address
    pub fn addr(&self) -> &str {
        &self.options.addr
    }

    pub fn protocol(&self) -> &'static str {
        self.transport.protocol()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    /// Bound address while running, when the transport has one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().run.as_ref().and_then(|run| run.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.manager().map_or(0, |m| m.connection_count())
    }

    /// Handles to all live connections
    pub fn connections(&self) -> Vec<Conn> {
        self.manager().map(|m| m.connections()).unwrap_or_default()
    }

    pub fn connection(&self, id: u64) -> Option<Conn> {
        self.manager()?.get(ConnectionId::from_raw(id))
    }

    fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.lifecycle.lock().run.as_ref().map(|run| run.manager.clone())
    }

    pub fn on_start(&mut self, handler: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_start = Some(Arc::new(handler));
    }

    pub fn on_stop(&mut self, handler: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_stop = Some(Arc::new(handler));
    }

    pub fn on_connect(&mut self, handler: impl Fn(&Conn) + Send + Sync + 'static) {
        self.hooks.on_connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&mut self, handler: impl Fn(&Conn) + Send + Sync + 'static) {
        self.hooks.on_disconnect = Some(Arc::new(handler));
    }

    pub fn on_receive(&mut self, handler: impl Fn(&Conn, Bytes, MessageType) + Send + Sync + 'static) {
        self.hooks.on_receive = Some(Arc::new(handler));
    }

    /// Bind the listener and start accepting.
    ///
    /// Fails with [`Error::InvalidState`] unless the server is stopped. A
    /// bind failure leaves the server stopped.
    pub async fn start(&self) -> Result<()> {
        self.transition("start", ServerState::Stopped, ServerState::Starting)?;
        self.lifecycle.lock().failure = None;

        let params = EndpointParams::from(&*self.options);
        let listener: Arc<dyn Listener> = match self.transport.listen(&params).await {
            Ok(listener) => Arc::from(listener),
            Err(source) => {
                self.lifecycle.lock().state = ServerState::Stopped;
                return Err(Error::Bind {
                    addr: self.options.addr.clone(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr().ok();

        let hooks = Arc::new(self.hooks.clone());
        let manager = ConnectionManager::new(
            ConnectionManagerConfig {
                max_connections: self.options.max_conn_num,
                heartbeat_interval: self
                    .options
                    .heartbeat_check
                    .then_some(self.options.heartbeat_interval),
            },
            hooks.clone(),
        );

        hooks.start();
        manager.start_heartbeat();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Held across the spawn so a failing loop observes Running
        let mut lifecycle = self.lifecycle.lock();
        let accept_task = tokio::spawn(serve(
            self.lifecycle.clone(),
            listener.clone(),
            manager.clone(),
            self.options.tuning,
            shutdown_rx,
        ));
        lifecycle.run = Some(Running {
            listener,
            local_addr,
            manager,
            hooks,
            shutdown_tx,
            accept_task,
        });
        lifecycle.state = ServerState::Running;
        drop(lifecycle);

        info!(
            addr = %self.options.addr,
            local_addr = ?local_addr,
            protocol = self.protocol(),
            max_connections = self.options.max_conn_num,
            heartbeat = self.options.heartbeat_check,
            "Server started"
        );
        Ok(())
    }

    /// Stop accepting, drain every connection and fire the stop hook.
    ///
    /// Returns the listener close error, if any, after draining anyway. If
    /// the accept loop already stopped the server on a non-transient error,
    /// that error is returned once as [`Error::Accept`].
    pub async fn stop(&self) -> Result<()> {
        let run = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ServerState::Stopped {
                if let Some(e) = lifecycle.failure.take() {
                    return Err(Error::Accept(e));
                }
            }
            if lifecycle.state != ServerState::Running {
                return Err(Error::InvalidState {
                    op: "stop",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = ServerState::Stopping;
            lifecycle.run.take()
        };

        let mut result = Ok(());
        if let Some(run) = run {
            info!(connections = run.manager.connection_count(), "Stopping server");

            // Signal first so the loop reads the close as requested
            run.shutdown_tx.send_replace(true);
            if let Err(e) = run.listener.close() {
                warn!(error = %e, "Failed to close listener");
                result = Err(Error::Close(e));
            }
            if let Err(e) = run.accept_task.await {
                warn!(error = %e, "Accept task failed");
            }

            run.manager.close_all().await;
            run.hooks.stop();
        }

        self.lifecycle.lock().state = ServerState::Stopped;
        info!("Server stopped");
        result
    }

    fn transition(&self, op: &'static str, from: ServerState, to: ServerState) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != from {
            return Err(Error::InvalidState {
                op,
                state: lifecycle.state,
            });
        }
        lifecycle.state = to;
        Ok(())
    }
}

/// Accept loop task; a loop failure stops the server the way `stop` would
async fn serve(
    lifecycle: Arc<Mutex<Lifecycle>>,
    listener: Arc<dyn Listener>,
    manager: Arc<ConnectionManager>,
    tuning: Tuning,
    shutdown: watch::Receiver<bool>,
) {
    let Some(failure) = accept_loop(listener, manager, tuning, shutdown).await else {
        return;
    };

    let run = {
        let mut lifecycle = lifecycle.lock();
        if lifecycle.state != ServerState::Running {
            // A concurrent stop owns the teardown
            return;
        }
        lifecycle.state = ServerState::Stopping;
        lifecycle.run.take()
    };

    error!(error = %failure, "Accept loop failed, stopping server");
    if let Some(run) = run {
        run.shutdown_tx.send_replace(true);
        if let Err(e) = run.listener.close() {
            warn!(error = %e, "Failed to close listener");
        }
        run.manager.close_all().await;
        run.hooks.stop();
    }

    let mut lifecycle = lifecycle.lock();
    lifecycle.failure = Some(failure);
    lifecycle.state = ServerState::Stopped;
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(run) = self.lifecycle.lock().run.take() {
            run.shutdown_tx.send_replace(true);
            let _ = run.listener.close();
            for conn in run.manager.connections() {
                let _ = conn.close();
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.options.addr)
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{AcceptError, Packet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn options(addr: &str, max_conn_num: usize) -> Arc<ServerOptions> {
        Arc::new(
            ServerOptions::builder()
                .listen_addr(addr)
                .max_conn_num(max_conn_num)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let transport = MemoryTransport::new();
        let server = Server::with_transport(options("lifecycle", 4), Arc::new(transport.clone()));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.protocol(), "memory");
        assert_eq!(server.addr(), "lifecycle");

        assert!(matches!(
            server.stop().await,
            Err(Error::InvalidState { op: "stop", state: ServerState::Stopped })
        ));

        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert!(transport.is_listening("lifecycle"));
        assert!(matches!(
            server.start().await,
            Err(Error::InvalidState { op: "start", state: ServerState::Running })
        ));

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!transport.is_listening("lifecycle"));
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let transport = MemoryTransport::new();
        let first = Server::with_transport(options("taken", 4), Arc::new(transport.clone()));
        first.start().await.unwrap();

        let second = Server::with_transport(options("taken", 4), Arc::new(transport.clone()));
        assert!(matches!(second.start().await, Err(Error::Bind { .. })));
        assert_eq!(second.state(), ServerState::Stopped);

        first.stop().await.unwrap();
        second.start().await.unwrap();
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_hooks() {
        let transport = MemoryTransport::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let mut server = Server::with_transport(options("hooks", 4), Arc::new(transport));
        let counter = starts.clone();
        server.on_start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = stops.clone();
        server.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.start().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        server.stop().await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_drains_connections() {
        let transport = MemoryTransport::new();
        let disconnects = Arc::new(AtomicUsize::new(0));

        let mut server = Server::with_transport(options("drain", 8), Arc::new(transport.clone()));
        let counter = disconnects.clone();
        server.on_disconnect(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        server.start().await.unwrap();

        let params = EndpointParams::from(&*options("drain", 8));
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(transport.dial(&params).await.unwrap());
        }
        while server.connection_count() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        server.stop().await.unwrap();
        assert_eq!(server.connection_count(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 3);
        for client in &clients {
            assert!(client.write(Packet::Heartbeat).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_fatal_accept_error_stops_server() {
        let transport = MemoryTransport::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let mut server = Server::with_transport(options("fatal", 8), Arc::new(transport.clone()));
        let counter = stops.clone();
        server.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = disconnects.clone();
        server.on_disconnect(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        server.start().await.unwrap();

        let params = EndpointParams::from(&*options("fatal", 8));
        let client = transport.dial(&params).await.unwrap();
        while server.connection_count() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(transport.inject_accept_error("fatal", AcceptError::Fatal(err)));
        while server.state() != ServerState::Stopped {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(server.connection_count(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(client.write(Packet::Heartbeat).await.is_err());
        assert!(!transport.is_listening("fatal"));
        assert!(transport.dial(&params).await.is_err());

        match server.stop().await {
            Err(Error::Accept(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected accept failure, got {other:?}"),
        }
        assert!(matches!(server.stop().await, Err(Error::InvalidState { .. })));
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        server.stop().await.unwrap();
    }
}
