//! # riptide-ws
//!
//! An RFC 6455 WebSocket protocol engine for tokio. One crate covers both
//! sides of a connection: servers upgrade accepted streams through an
//! [`Upgrader`], clients open connections with [`client::dial`]. Parsed
//! messages are dispatched to a [`Handler`], writes go out either
//! synchronously or through a per-connection FIFO queue, and
//! `permessage-deflate` (RFC 7692) is negotiated with full context-takeover
//! support.
//!
//! ## Features
//!
//! - Incremental frame parser with strict protocol enforcement
//! - Streaming UTF-8 validation across fragment boundaries
//! - Shared deflate contexts with sliding-window reuse across messages
//! - Asynchronous write queue with FIFO ordering across producers
//! - [`Broadcaster`]: encode once, send to any number of connections
//! - Pooled buffers for frame assembly
//!
//! ## Server example
//!
//! ```ignore
//! use riptide_ws::{Config, Conn, Handler, Message, Upgrader};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &Arc<Conn>, message: Message) {
//!         let _ = conn.write_async(message.opcode(), message.payload());
//!     }
//! }
//!
//! let upgrader = Upgrader::new(Config::default(), Echo);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9001").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     if let Ok(conn) = upgrader.accept(stream).await {
//!         tokio::spawn(async move { conn.read_loop().await });
//!     }
//! }
//! ```

pub mod broadcast;
pub mod client;
pub mod conn;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod mask;
pub mod pool;
pub mod upgrader;
pub mod utf8;

pub use broadcast::Broadcaster;
pub use conn::{Conn, Message, Role, Transport};
pub use error::{CloseReason, Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use handler::{DefaultHandler, Handler};
pub use upgrader::Upgrader;

use std::time::Duration;

use crate::deflate::DeflateConfig;

/// GUID appended to the client key when deriving `Sec-WebSocket-Accept`
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest possible frame header: 2 base + 8 length + 4 mask
pub const MAX_HEADER_SIZE: usize = 14;

/// Payloads up to this length encode inline in the second header byte
pub const LEN16_THRESHOLD: usize = 125;

/// Payloads up to this length use the 2-byte extended length form
pub const LEN64_THRESHOLD: usize = 65535;

/// Read granularity of the per-connection input buffer
pub(crate) const RECV_CHUNK_SIZE: usize = 16 * 1024;

/// Per-connection limits and policy.
///
/// ```
/// use riptide_ws::Config;
///
/// let config = Config::builder()
///     .read_max_payload_size(1 << 20)
///     .compress_enabled(true)
///     .compress_level(4)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on one assembled message, inflated size included
    /// (default: 16 MiB). Exceeding it closes with 1009.
    pub read_max_payload_size: usize,
    /// Upper bound on one outgoing payload after optional compression
    /// (default: 16 MiB)
    pub write_max_payload_size: usize,
    /// Offer / accept permessage-deflate (default: false)
    pub compress_enabled: bool,
    /// Data frames below this length are never compressed (default: 512)
    pub compress_threshold: usize,
    /// Deflate level 1–9 (default: 6)
    pub compress_level: u32,
    /// Validate text payloads on ingress and egress (default: true)
    pub check_utf8_enabled: bool,
    /// Deadline for the whole upgrade exchange (default: 10 s)
    pub handshake_timeout: Duration,
    /// Dispatch `on_message` on the runtime instead of inline in the read
    /// loop (default: false). Trades callback ordering for parallelism.
    pub read_async_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_max_payload_size: 16 * 1024 * 1024,
            write_max_payload_size: 16 * 1024 * 1024,
            compress_enabled: false,
            compress_threshold: 512,
            compress_level: 6,
            check_utf8_enabled: true,
            handshake_timeout: Duration::from_secs(10),
            read_async_enabled: false,
        }
    }
}

impl Config {
    /// Start building a configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Baseline deflate parameters before negotiation refines them.
    pub(crate) fn deflate_config(&self) -> DeflateConfig {
        DeflateConfig {
            level: self.compress_level,
            threshold: self.compress_threshold,
            ..DeflateConfig::default()
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the maximum assembled inbound message size.
    pub fn read_max_payload_size(mut self, n: usize) -> Self {
        self.config.read_max_payload_size = n;
        self
    }

    /// Set the maximum outbound payload size.
    pub fn write_max_payload_size(mut self, n: usize) -> Self {
        self.config.write_max_payload_size = n;
        self
    }

    /// Offer / accept permessage-deflate.
    pub fn compress_enabled(mut self, enabled: bool) -> Self {
        self.config.compress_enabled = enabled;
        self
    }

    /// Set the minimum payload length worth compressing.
    pub fn compress_threshold(mut self, n: usize) -> Self {
        self.config.compress_threshold = n;
        self
    }

    /// Set the deflate level (1–9).
    pub fn compress_level(mut self, level: u32) -> Self {
        self.config.compress_level = level.clamp(1, 9);
        self
    }

    /// Enable or disable text payload validation.
    pub fn check_utf8_enabled(mut self, enabled: bool) -> Self {
        self.config.check_utf8_enabled = enabled;
        self
    }

    /// Set the handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Dispatch message callbacks on the runtime.
    pub fn read_async_enabled(mut self, enabled: bool) -> Self {
        self.config.read_async_enabled = enabled;
        self
    }

    /// Finish building.
    pub fn build(self) -> Config {
        self.config
    }
}
