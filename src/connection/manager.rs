//! Connection manager
//!
//! Owns the registry of live connections, hands out IDs and spawns one
//! reader task per admitted session.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::conn::Conn;
use super::reader;
use super::state::{ConnectionId, ConnectionInfo};
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::metrics::METRICS;
use crate::transport::Session;

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Sweep period for idle eviction, `None` disables sweeps
    pub heartbeat_interval: Option<Duration>,
}

#[derive(Default)]
struct Admission {
    draining: bool,
}

/// Manages all active connections
pub struct ConnectionManager {
    /// Live connections by ID
    connections: DashMap<ConnectionId, Conn>,
    /// Serializes the capacity check, draining flag and insert
    admission: Mutex<Admission>,
    /// ID generator, never reused
    next_id: AtomicU64,
    /// Reader tasks that have not exited yet
    readers: AtomicUsize,
    readers_done: Notify,
    pub(super) heartbeat: Mutex<Option<JoinHandle<()>>>,
    pub(super) config: ConnectionManagerConfig,
    hooks: Arc<Hooks>,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(config: ConnectionManagerConfig, hooks: Arc<Hooks>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::with_capacity(config.max_connections.min(1024)),
            admission: Mutex::new(Admission::default()),
            next_id: AtomicU64::new(1),
            readers: AtomicUsize::new(0),
            readers_done: Notify::new(),
            heartbeat: Mutex::new(None),
            config,
            hooks,
        })
    }

    /// Admit a raw session.
    ///
    /// On success the connection is registered and its reader task is
    /// running. On failure the session has already been closed.
    pub fn allocate(self: &Arc<Self>, session: Box<dyn Session>) -> Result<Conn> {
        let conn = {
            let admission = self.admission.lock();
            let rejection = if admission.draining {
                Some(Error::ManagerClosed)
            } else if self.connections.len() >= self.config.max_connections {
                Some(Error::CapacityExceeded {
                    max: self.config.max_connections,
                })
            } else {
                None
            };

            if let Some(err) = rejection {
                drop(admission);
                session.close();
                METRICS.connection_rejected();
                debug!(error = %err, "Session rejected");
                return Err(err);
            }

            let id = ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
            let conn = Conn::new(id, session);
            self.connections.insert(id, conn.clone());
            self.readers.fetch_add(1, Ordering::AcqRel);
            conn
        };

        Ok(self.spawn_reader(conn))
    }

    fn spawn_reader(self: &Arc<Self>, conn: Conn) -> Conn {
        METRICS.connection_opened();
        info!(
            conn_id = %conn.conn_id(),
            remote_addr = ?conn.remote_addr(),
            active = self.connections.len(),
            "Connection opened"
        );

        let guard = ReaderGuard {
            manager: self.clone(),
            id: conn.conn_id(),
        };
        let hooks = self.hooks.clone();
        let task_conn = conn.clone();
        tokio::spawn(async move {
            reader::run(task_conn, hooks, |conn: &Conn| {
                guard.manager.remove(conn.conn_id());
            })
            .await;
            drop(guard);
        });

        conn
    }

    /// Look up a live connection
    pub fn get(&self, id: ConnectionId) -> Option<Conn> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Remove a connection and close its session.
    ///
    /// Returns false if the ID was not registered. The disconnect hook is
    /// fired by the reader task, once.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };

        conn.shutdown_session();
        METRICS.connection_closed();

        let info = conn.info();
        info!(
            conn_id = %id,
            duration_secs = info.duration_secs,
            bytes_rx = info.bytes_rx,
            bytes_tx = info.bytes_tx,
            "Connection removed"
        );
        true
    }

    /// Close every connection and wait for all readers to exit.
    ///
    /// Allocation fails with [`Error::ManagerClosed`] from the moment this
    /// is called.
    pub async fn close_all(&self) {
        self.admission.lock().draining = true;
        self.stop_heartbeat();

        let conns = self.connections();
        info!(connections = conns.len(), "Draining connections");
        for conn in &conns {
            conn.shutdown_session();
        }

        self.wait_readers().await;

        if !self.connections.is_empty() {
            warn!(
                remaining = self.connections.len(),
                "Registry not empty after drain"
            );
        }
        info!("All connections drained");
    }

    async fn wait_readers(&self) {
        loop {
            let notified = self.readers_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.readers.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Get current connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handles to all live connections
    pub fn connections(&self) -> Vec<Conn> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// List all active connections
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Check if at capacity
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.config.max_connections
    }

    pub fn is_draining(&self) -> bool {
        self.admission.lock().draining
    }
}

/// Held by each reader task; releases the reader slot even if a hook panics
struct ReaderGuard {
    manager: Arc<ConnectionManager>,
    id: ConnectionId,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.manager.remove(self.id);
        if self.manager.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.manager.readers_done.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::connection::ConnState;
    use crate::transport::memory::{session_pair, MemorySession};
    use crate::transport::{MessageType, Packet};
    use std::collections::HashSet;

    fn manager(max_connections: usize, hooks: Hooks) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            ConnectionManagerConfig {
                max_connections,
                heartbeat_interval: None,
            },
            Arc::new(hooks),
        )
    }

    fn session() -> (Box<dyn Session>, MemorySession) {
        let (local, remote) = session_pair();
        (Box::new(local), remote)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocate_respects_capacity() {
        let manager = manager(10, Hooks::default());
        let mut peers = Vec::new();
        let mut tasks = Vec::new();

        for _ in 0..50 {
            let (local, remote) = session();
            peers.push(remote);
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.allocate(local) }));
        }

        let mut ids = HashSet::new();
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(conn) => assert!(ids.insert(conn.id())),
                Err(Error::CapacityExceeded { max }) => {
                    assert_eq!(max, 10);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(ids.len(), 10);
        assert_eq!(rejected, 40);
        assert_eq!(manager.connection_count(), 10);
        assert!(manager.is_full());
        assert_eq!(peers.iter().filter(|p| p.is_closed()).count(), 40);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let manager = manager(1, Hooks::default());

        let (local, _remote) = session();
        let first = manager.allocate(local).unwrap();
        assert!(manager.remove(first.conn_id()));

        let (local, _remote) = session();
        let second = manager.allocate(local).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
    }

    #[tokio::test]
    async fn test_double_remove_fires_disconnect_once() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        let hooks = Hooks {
            on_disconnect: Some(Arc::new(move |_conn: &Conn| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let manager = manager(4, hooks);

        let (local, remote) = session();
        let conn = manager.allocate(local).unwrap();
        assert_eq!(manager.get(conn.conn_id()).map(|c| c.id()), Some(conn.id()));

        assert!(manager.remove(conn.conn_id()));
        assert!(!manager.remove(conn.conn_id()));
        assert!(manager.get(conn.conn_id()).is_none());
        assert!(remote.is_closed());

        manager.close_all().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_close_all_drains_and_rejects() {
        let manager = manager(8, Hooks::default());
        let mut remotes = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..3 {
            let (local, remote) = session();
            conns.push(manager.allocate(local).unwrap());
            remotes.push(remote);
        }

        manager.close_all().await;

        assert_eq!(manager.connection_count(), 0);
        assert!(manager.is_draining());
        assert!(remotes.iter().all(|r| r.is_closed()));
        assert!(conns.iter().all(|c| c.state() == ConnState::Closed));

        let (local, remote) = session();
        assert!(matches!(manager.allocate(local), Err(Error::ManagerClosed)));
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn test_hooks_fire_in_order() {
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let (connect, receive, disconnect) = (events.clone(), events.clone(), events.clone());
        let hooks = Hooks {
            on_connect: Some(Arc::new(move |conn: &Conn| {
                connect.lock().push(format!("connect {}", conn.id()));
            })),
            on_receive: Some(Arc::new(move |_conn: &Conn, payload: Bytes, msg_type: MessageType| {
                assert_eq!(msg_type, MessageType::Binary);
                receive.lock().push(format!("receive {}", payload.len()));
            })),
            on_disconnect: Some(Arc::new(move |conn: &Conn| {
                disconnect.lock().push(format!("disconnect {}", conn.id()));
            })),
            ..Default::default()
        };
        let manager = manager(4, hooks);

        let (local, remote) = session();
        let conn = manager.allocate(local).unwrap();
        remote.write(Packet::Heartbeat).await.unwrap();
        remote.write(Packet::binary(&b"abc"[..])).await.unwrap();
        remote.write(Packet::binary(&b"de"[..])).await.unwrap();

        while conn.info().bytes_rx < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        remote.close();
        manager.close_all().await;

        assert_eq!(
            *events.lock(),
            vec!["connect 1", "receive 3", "receive 2", "disconnect 1"]
        );
    }

    #[tokio::test]
    async fn test_peer_close_deregisters() {
        let manager = manager(4, Hooks::default());
        let (local, remote) = session();
        let conn = manager.allocate(local).unwrap();
        assert_eq!(manager.list_connections().len(), 1);

        remote.close();
        while manager.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_panicking_hooks_still_reach_disconnect() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        let hooks = Hooks {
            on_receive: Some(Arc::new(|_conn: &Conn, _payload: Bytes, _msg_type: MessageType| {
                panic!("receive hook failed")
            })),
            on_disconnect: Some(Arc::new(move |_conn: &Conn| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let receive_failing = manager(4, hooks);

        let (local, remote) = session();
        let conn = receive_failing.allocate(local).unwrap();
        remote.write(Packet::binary(&b"x"[..])).await.unwrap();

        while conn.state() != ConnState::Closed {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(receive_failing.connection_count(), 0);
        assert!(remote.is_closed());

        let hooks = Hooks {
            on_connect: Some(Arc::new(|_conn: &Conn| panic!("connect hook failed"))),
            ..Default::default()
        };
        let connect_failing = manager(4, hooks);
        let (local, remote) = session();
        let conn = connect_failing.allocate(local).unwrap();
        connect_failing.close_all().await;
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(remote.is_closed());
    }
}
