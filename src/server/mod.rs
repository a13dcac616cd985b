//! Server implementation
//!
//! Listener lifecycle, accept loop with backoff and connection draining.

mod acceptor;
mod listener;

use serde::Serialize;

pub use acceptor::{INITIAL_BACKOFF, MAX_BACKOFF};
pub use listener::Server;

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}
