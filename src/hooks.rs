//! Lifecycle hooks
//!
//! Hooks are plain synchronous callbacks. A server or client snapshots its
//! hook set when it starts or dials, so registration is only meaningful
//! before that point.
//!
//! A panicking hook is caught and logged. Connect and receive report it so
//! the reader can close that connection; the rest of the lifecycle still
//! runs. Builds with `panic = "abort"` abort instead.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::error;

use crate::connection::Conn;
use crate::transport::MessageType;

pub type StartHandler = Arc<dyn Fn() + Send + Sync>;
pub type StopHandler = Arc<dyn Fn() + Send + Sync>;
pub type ConnectHandler = Arc<dyn Fn(&Conn) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&Conn) + Send + Sync>;
pub type ReceiveHandler = Arc<dyn Fn(&Conn, Bytes, MessageType) + Send + Sync>;

/// Registered callbacks
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) on_start: Option<StartHandler>,
    pub(crate) on_stop: Option<StopHandler>,
    pub(crate) on_connect: Option<ConnectHandler>,
    pub(crate) on_disconnect: Option<DisconnectHandler>,
    pub(crate) on_receive: Option<ReceiveHandler>,
}

impl Hooks {
    pub(crate) fn start(&self) {
        if let Some(handler) = &self.on_start {
            guarded("start", None, || handler());
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(handler) = &self.on_stop {
            guarded("stop", None, || handler());
        }
    }

    /// Returns false if the hook panicked
    pub(crate) fn connect(&self, conn: &Conn) -> bool {
        match &self.on_connect {
            Some(handler) => guarded("connect", Some(conn.id()), || handler(conn)),
            None => true,
        }
    }

    pub(crate) fn disconnect(&self, conn: &Conn) {
        if let Some(handler) = &self.on_disconnect {
            guarded("disconnect", Some(conn.id()), || handler(conn));
        }
    }

    /// Returns false if the hook panicked
    pub(crate) fn receive(&self, conn: &Conn, payload: Bytes, msg_type: MessageType) -> bool {
        match &self.on_receive {
            Some(handler) => guarded("receive", Some(conn.id()), || handler(conn, payload, msg_type)),
            None => true,
        }
    }
}

fn guarded(hook: &'static str, conn_id: Option<u64>, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(hook, conn_id, panic = panic_message(&*payload), "Hook panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .finish()
    }
}
