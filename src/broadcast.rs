//! One encode, many sends
//!
//! Sending the same payload to N connections through `write_async` builds
//! and (when negotiated) compresses the frame N times. A [`Broadcaster`]
//! encodes at most twice — one frame for plain targets, one for targets
//! with permessage-deflate — and shares those bytes across every queue.
//!
//! Lifetime is tracked as an explicit `(pending, closed)` pair: `broadcast`
//! bumps `pending`, each queue consumer reports completion, and the frames
//! are released once `close` was called and `pending` drained to zero.
//! Enqueue every broadcast before calling [`Broadcaster::close`];
//! broadcasting afterwards fails with `ConnClosed`.
//!
//! ```ignore
//! let broadcaster = Broadcaster::new(OpCode::Text, "tick");
//! for conn in &connections {
//!     let _ = broadcaster.broadcast(conn);
//! }
//! broadcaster.close();
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::frame::OpCode;

/// Index of the frame slot for plain targets
const SLOT_PLAIN: usize = 0;
/// Index of the frame slot for compressed targets
const SLOT_COMPRESSED: usize = 1;

struct State {
    /// Broadcasts enqueued but not yet completed by a queue consumer
    pending: usize,
    /// Whether `close` was called
    closed: bool,
}

/// Precomputed frames shared across many connections.
pub struct Broadcaster {
    opcode: OpCode,
    payload: Bytes,
    slots: [Mutex<Option<Bytes>>; 2],
    state: Mutex<State>,
}

impl Broadcaster {
    /// Create a broadcaster for one payload.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            opcode,
            payload: payload.into(),
            slots: [Mutex::new(None), Mutex::new(None)],
            state: Mutex::new(State {
                pending: 0,
                closed: false,
            }),
        })
    }

    /// Enqueue this broadcaster's frame on `conn`'s write queue.
    ///
    /// The matching slot is encoded from `conn`'s perspective on first use
    /// and reused verbatim for every later target with the same
    /// compression state.
    pub fn broadcast(self: &Arc<Self>, conn: &Arc<Conn>) -> Result<()> {
        let idx = if conn.compress_negotiated() {
            SLOT_COMPRESSED
        } else {
            SLOT_PLAIN
        };

        let frame = {
            let mut slot = self.slots[idx].lock();
            match &*slot {
                Some(frame) => frame.clone(),
                None => {
                    let frame = conn.gen_frame(self.opcode, &self.payload)?.freeze();
                    *slot = Some(frame.clone());
                    frame
                }
            }
        };

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::ConnClosed);
            }
            state.pending += 1;
        }

        if let Err(e) = conn.enqueue_broadcast(frame, self.clone()) {
            // The queue is gone; the consumer will never report back.
            self.complete();
            return Err(e);
        }
        Ok(())
    }

    /// Called by a queue consumer once its send finished (or was skipped
    /// because the target had already closed).
    pub(crate) fn complete(&self) {
        let release = {
            let mut state = self.state.lock();
            state.pending -= 1;
            state.closed && state.pending == 0
        };
        if release {
            self.release();
        }
    }

    /// Declare that no further broadcasts will be enqueued. The shared
    /// frames are released as soon as all outstanding sends complete.
    pub fn close(&self) {
        let release = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending == 0
        };
        if release {
            self.release();
        }
    }

    /// Number of sends still outstanding. Diagnostic only.
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Whether the shared frames are still held.
    pub fn frames_held(&self) -> bool {
        self.slots.iter().any(|s| s.lock().is_some())
    }

    fn release(&self) {
        for slot in &self.slots {
            *slot.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_requires_close_and_drain() {
        let b = Broadcaster::new(OpCode::Text, "payload");

        // Simulate two enqueued sends without touching a real connection
        {
            let mut state = b.state.lock();
            state.pending = 2;
        }
        *b.slots[SLOT_PLAIN].lock() = Some(Bytes::from_static(b"frame"));

        b.complete();
        assert!(b.frames_held(), "release before close");

        b.close();
        assert!(b.frames_held(), "release before last completion");

        b.complete();
        assert!(!b.frames_held());
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn test_close_with_nothing_pending_releases() {
        let b = Broadcaster::new(OpCode::Binary, vec![1u8, 2, 3]);
        *b.slots[SLOT_COMPRESSED].lock() = Some(Bytes::from_static(b"frame"));

        b.close();
        assert!(!b.frames_held());
    }
}
