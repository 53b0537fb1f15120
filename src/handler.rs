//! Connection event callbacks
//!
//! Implement [`Handler`] and hand it to an [`Upgrader`](crate::Upgrader) or
//! [`dial`](crate::client::dial). Every method has a default, so a handler
//! only implements the events it cares about. Callbacks for one connection
//! run sequentially in arrival order unless `read_async_enabled` moves
//! message dispatch onto the runtime.

use std::sync::Arc;

use bytes::Bytes;

use crate::conn::{Conn, Message};
use crate::error::Error;
use crate::frame::OpCode;

/// Callback bundle consumed by the engine.
pub trait Handler: Send + Sync + 'static {
    /// The connection finished its handshake and entered the open state.
    fn on_open(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// A complete Text or Binary message arrived.
    fn on_message(&self, conn: &Arc<Conn>, message: Message) {
        let _ = (conn, message);
    }

    /// A ping arrived. The default echoes the payload back as a pong
    /// through the async write queue.
    fn on_ping(&self, conn: &Arc<Conn>, payload: Bytes) {
        let _ = conn.write_async(OpCode::Pong, payload.as_ref());
    }

    /// A pong arrived.
    fn on_pong(&self, conn: &Arc<Conn>, payload: Bytes) {
        let _ = (conn, payload);
    }

    /// The connection terminated. Called exactly once per connection; a
    /// clean peer close arrives as [`Error::Closed`].
    fn on_close(&self, conn: &Arc<Conn>, err: &Error) {
        let _ = (conn, err);
    }
}

/// Handler that leaves every event at its default behavior.
///
/// Useful for write-only endpoints and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}
