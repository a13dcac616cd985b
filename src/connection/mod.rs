//! Connection management
//!
//! Connection handles, the registry that owns them, their reader tasks and
//! idle supervision.

mod conn;
mod heartbeat;
mod manager;
mod reader;
mod state;

pub use conn::Conn;
pub use heartbeat::HEARTBEAT_MISS_MULTIPLIER;
pub use manager::{ConnectionManager, ConnectionManagerConfig};
pub use state::{ConnState, ConnectionId, ConnectionInfo};

pub(crate) use reader::run as run_reader;
