//! Accept loop
//!
//! Pulls sessions off the listener and admits them through the connection
//! manager. Transient accept failures are retried with exponential backoff.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::connection::ConnectionManager;
use crate::metrics::METRICS;
use crate::options::Tuning;
use crate::transport::{AcceptError, Listener};

/// First retry delay after a transient accept error
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
/// Retry delay ceiling
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential accept backoff: 5ms, doubling, capped at 1s
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            INITIAL_BACKOFF
        } else {
            (self.current * 2).min(MAX_BACKOFF)
        };
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Run until the listener closes, fails fatally or `shutdown` flips.
///
/// Returns the error that ended the loop when it stopped without being
/// asked to.
pub(super) async fn accept_loop(
    listener: Arc<dyn Listener>,
    manager: Arc<ConnectionManager>,
    tuning: Tuning,
    mut shutdown: watch::Receiver<bool>,
) -> Option<io::Error> {
    let mut backoff = Backoff::default();

    let failure = loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break None,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(session) => {
                backoff.reset();
                if let Err(e) = session.apply_tuning(&tuning) {
                    debug!(error = %e, "Failed to apply session tuning");
                }
                if let Err(e) = manager.allocate(session) {
                    warn!(error = %e, "Connection rejected");
                }
            }
            Err(AcceptError::Transient(e)) => {
                METRICS.accept_error();
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Accept error"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => break None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(AcceptError::Closed) if *shutdown.borrow() => break None,
            Err(AcceptError::Closed) => {
                error!("Listener closed while the server was running");
                break Some(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener closed unexpectedly",
                ));
            }
            Err(AcceptError::Fatal(e)) => {
                METRICS.accept_error();
                error!(error = %e, "Accept loop stopped");
                break Some(e);
            }
        }
    };

    debug!(failed = failure.is_some(), "Accept loop exited");
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManagerConfig;
    use crate::hooks::Hooks;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{EndpointParams, Transport};
    use std::io;
    use std::time::Instant;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    fn params() -> EndpointParams {
        EndpointParams {
            addr: "acceptor".to_string(),
            max_msg_len: 1024,
            cipher: None,
            shards: Default::default(),
            tuning: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_back_off_then_recover() {
        let transport = MemoryTransport::new();
        let listener: Arc<dyn Listener> = Arc::from(transport.listen(&params()).await.unwrap());
        let manager = ConnectionManager::new(
            ConnectionManagerConfig {
                max_connections: 4,
                heartbeat_interval: None,
            },
            Arc::new(Hooks::default()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for _ in 0..3 {
            let err = io::Error::from(io::ErrorKind::ConnectionAborted);
            assert!(transport.inject_accept_error("acceptor", AcceptError::Transient(err)));
        }
        let _client = transport.dial(&params()).await.unwrap();

        let started = Instant::now();
        let task = tokio::spawn(accept_loop(
            listener.clone(),
            manager.clone(),
            Tuning::default(),
            shutdown_rx,
        ));

        while manager.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // 5 + 10 + 20 ms of backoff before the session is reached
        assert!(started.elapsed() >= Duration::from_millis(35));

        shutdown_tx.send_replace(true);
        assert!(task.await.unwrap().is_none());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff_sleep() {
        let transport = MemoryTransport::new();
        let listener: Arc<dyn Listener> = Arc::from(transport.listen(&params()).await.unwrap());
        let manager = ConnectionManager::new(
            ConnectionManagerConfig {
                max_connections: 4,
                heartbeat_interval: None,
            },
            Arc::new(Hooks::default()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Push the backoff to its ceiling so an uninterrupted sleep lasts 1s.
        for _ in 0..12 {
            let err = io::Error::from(io::ErrorKind::ConnectionReset);
            transport.inject_accept_error("acceptor", AcceptError::Transient(err));
        }

        let task = tokio::spawn(accept_loop(listener, manager, Tuning::default(), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        shutdown_tx.send_replace(true);
        assert!(task.await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_fatal_error_is_returned() {
        let transport = MemoryTransport::new();
        let listener: Arc<dyn Listener> = Arc::from(transport.listen(&params()).await.unwrap());
        let manager = ConnectionManager::new(
            ConnectionManagerConfig {
                max_connections: 4,
                heartbeat_interval: None,
            },
            Arc::new(Hooks::default()),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        transport.inject_accept_error("acceptor", AcceptError::Fatal(err));

        let failure = tokio::time::timeout(
            Duration::from_secs(1),
            accept_loop(listener, manager, Tuning::default(), shutdown_rx),
        )
        .await
        .unwrap();
        assert_eq!(failure.unwrap().kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_unrequested_close_is_a_failure() {
        let transport = MemoryTransport::new();
        let listener: Arc<dyn Listener> = Arc::from(transport.listen(&params()).await.unwrap());
        let manager = ConnectionManager::new(
            ConnectionManagerConfig {
                max_connections: 4,
                heartbeat_interval: None,
            },
            Arc::new(Hooks::default()),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        listener.close().unwrap();
        let failure = accept_loop(listener.clone(), manager.clone(), Tuning::default(), shutdown_rx).await;
        assert_eq!(failure.unwrap().kind(), io::ErrorKind::NotConnected);

        // The same close after shutdown is requested is a clean exit
        let (_tx, rx) = watch::channel(true);
        assert!(accept_loop(listener, manager, Tuning::default(), rx).await.is_none());
    }
}
