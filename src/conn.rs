//! Connection state, read loop and write paths
//!
//! A [`Conn`] owns its transport split into halves: the read half lives
//! inside the read state and is driven by the single [`read_loop`] task;
//! the write half sits behind an async mutex shared by the synchronous
//! write path and the queue consumer, so direct and queued writes can
//! never interleave bytes. `write_async` jobs funnel through an unbounded
//! channel drained by one consumer task, which preserves FIFO order across
//! producers.
//!
//! [`read_loop`]: Conn::read_loop

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, trace};

use crate::broadcast::Broadcaster;
use crate::deflate::{DeflateConfig, DeflateDecoder, DeflateEncoder};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{
    build_close_payload, encode_frame, generate_header, parse_close_payload, Frame, FrameParser,
    OpCode, MAX_CONTROL_PAYLOAD,
};
use crate::handler::Handler;
use crate::mask::apply_mask;
use crate::pool;
use crate::utf8::{validate_utf8, Utf8Validator};
use crate::{Config, MAX_HEADER_SIZE, RECV_CHUNK_SIZE};

/// Byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxTransport = Box<dyn Transport>;

/// Endpoint role; decides the masking direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepting side: sends unmasked, requires masked input
    Server,
    /// Dialing side: sends masked, requires unmasked input
    Client,
}

impl Role {
    /// True for the accepting side
    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }
}

/// A complete data message, assembled from one or more frames.
#[derive(Debug, Clone)]
pub enum Message {
    /// UTF-8 text payload
    Text(Bytes),
    /// Binary payload
    Binary(Bytes),
}

impl Message {
    /// The data opcode this message was carried with.
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Text content, `None` for binary messages or invalid UTF-8 (possible
    /// only when ingress validation was disabled).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Consume the message, keeping the payload.
    pub fn into_payload(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }
}

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSING: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Deferred write owned by the queue.
pub(crate) enum WriteJob {
    /// Frame built by `write_async`; the buffer returns to the pool after
    /// the transport write
    Frame(BytesMut),
    /// Shared broadcast frame; completion is reported back to the
    /// broadcaster whether or not the write happened
    Broadcast {
        frame: Bytes,
        shared: Arc<Broadcaster>,
    },
    /// Frame construction failed in `write_async`; close through the queue
    /// so earlier jobs still drain first
    Shutdown(Error),
}

/// In-progress fragmented message.
struct Continuation {
    opcode: OpCode,
    buf: BytesMut,
    compressed: bool,
    utf8: Utf8Validator,
}

/// Everything the read loop owns.
struct ReadState {
    transport: ReadHalf<BoxTransport>,
    buf: BytesMut,
    parser: FrameParser,
    decompressor: Option<DeflateDecoder>,
    continuation: Option<Continuation>,
}

enum Flow {
    Continue,
    PeerClosed(Option<CloseReason>),
}

/// One WebSocket connection.
///
/// Cheap to share: all public methods take `&Arc<Conn>`. Constructed by
/// [`Upgrader::accept`](crate::Upgrader::accept), [`dial`](crate::client::dial),
/// or directly from an already-upgraded transport via [`Conn::server`] /
/// [`Conn::client`].
pub struct Conn {
    role: Role,
    config: Arc<Config>,
    handler: Arc<dyn Handler>,
    protocol: Option<String>,
    status: AtomicU8,
    close_emitted: AtomicBool,
    /// Wakes a read parked on the transport once the close path has run
    shutdown: Notify,
    compressor: Option<SyncMutex<DeflateEncoder>>,
    read: AsyncMutex<ReadState>,
    write: Arc<AsyncMutex<WriteHalf<BoxTransport>>>,
    jobs: mpsc::UnboundedSender<WriteJob>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.role)
            .field("status", &self.status.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn with_initial<S>(
        stream: S,
        role: Role,
        config: Arc<Config>,
        handler: Arc<dyn Handler>,
        deflate: Option<DeflateConfig>,
        protocol: Option<String>,
        initial: BytesMut,
    ) -> Arc<Self>
    where
        S: Transport + 'static,
    {
        let boxed: BoxTransport = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        let compress = deflate.is_some();
        let (compressor, decompressor) = match &deflate {
            Some(cfg) => (
                Some(SyncMutex::new(cfg.encoder(role.is_server()))),
                Some(cfg.decoder(role.is_server())),
            ),
            None => (None, None),
        };

        let mut buf = BytesMut::with_capacity(RECV_CHUNK_SIZE.max(initial.len()));
        buf.extend_from_slice(&initial);

        let (jobs, job_rx) = mpsc::unbounded_channel();
        let write = Arc::new(AsyncMutex::new(write_half));

        let conn = Arc::new(Self {
            role,
            config: config.clone(),
            handler,
            protocol,
            status: AtomicU8::new(STATUS_OPEN),
            close_emitted: AtomicBool::new(false),
            shutdown: Notify::new(),
            compressor,
            read: AsyncMutex::new(ReadState {
                transport: read_half,
                buf,
                parser: FrameParser::new(
                    config.read_max_payload_size,
                    role.is_server(),
                    compress,
                ),
                decompressor,
                continuation: None,
            }),
            write: write.clone(),
            jobs,
        });

        tokio::spawn(drain_write_queue(Arc::downgrade(&conn), write, job_rx));
        conn
    }

    /// Wrap an already-upgraded server-side transport. No compression.
    pub fn server<S>(stream: S, config: Config, handler: impl Handler) -> Arc<Self>
    where
        S: Transport + 'static,
    {
        Self::with_initial(
            stream,
            Role::Server,
            Arc::new(config),
            Arc::new(handler),
            None,
            None,
            BytesMut::new(),
        )
    }

    /// Wrap an already-upgraded client-side transport. No compression.
    pub fn client<S>(stream: S, config: Config, handler: impl Handler) -> Arc<Self>
    where
        S: Transport + 'static,
    {
        Self::with_initial(
            stream,
            Role::Client,
            Arc::new(config),
            Arc::new(handler),
            None,
            None,
            BytesMut::new(),
        )
    }

    /// This endpoint's role.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether permessage-deflate was negotiated.
    #[inline]
    pub fn compress_negotiated(&self) -> bool {
        self.compressor.is_some()
    }

    /// The subprotocol agreed during the handshake, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Whether the connection is still fully open.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_OPEN
    }

    /// Whether the close protocol has finished.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_CLOSED
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    /// Drive the connection until it terminates.
    ///
    /// Call exactly once per connection, after registering interest via the
    /// handler. The terminal condition — peer close, protocol violation,
    /// transport failure — is delivered to `Handler::on_close`. Closing the
    /// connection cancels an in-flight read, so the loop terminates even
    /// when the peer stays silent.
    pub async fn read_loop(self: &Arc<Self>) {
        let mut state = self.read.lock().await;

        let err = loop {
            if self.close_emitted.load(Ordering::SeqCst) {
                // Close already delivered by the write side; stop quietly.
                drop(state);
                return;
            }
            match self.advance(&mut state).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::PeerClosed(reason)) => break Error::Closed(reason),
                Err(e) => break e,
            }
        };

        drop(state);
        trace!(error = %err, "read loop terminating");
        self.emit(&err).await;
    }

    /// Read and dispatch one frame.
    async fn advance(self: &Arc<Self>, state: &mut ReadState) -> Result<Flow> {
        let frame = loop {
            if let Some(frame) = state.parser.parse(&mut state.buf, pool::global())? {
                break frame;
            }
            state.buf.reserve(RECV_CHUNK_SIZE);
            // Race the transport read against local closure so that
            // `close()` unparks a read loop waiting on a quiet peer.
            let n = tokio::select! {
                res = state.transport.read_buf(&mut state.buf) => res?,
                _ = self.shutdown.notified() => return Err(Error::ConnClosed),
            };
            if n == 0 {
                return Err(Error::ConnClosed);
            }
        };

        match frame.header.opcode {
            OpCode::Ping => {
                self.handler.on_ping(self, frame.payload.freeze());
                Ok(Flow::Continue)
            }
            OpCode::Pong => {
                self.handler.on_pong(self, frame.payload.freeze());
                Ok(Flow::Continue)
            }
            OpCode::Close => {
                let reason = parse_close_payload(&frame.payload)?;
                let _ = self.status.compare_exchange(
                    STATUS_OPEN,
                    STATUS_CLOSING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Ok(Flow::PeerClosed(reason))
            }
            OpCode::Text | OpCode::Binary => self.on_data_frame(state, frame),
            OpCode::Continuation => self.on_continuation(state, frame),
        }
    }

    fn on_data_frame(self: &Arc<Self>, state: &mut ReadState, frame: Frame) -> Result<Flow> {
        if state.continuation.is_some() {
            return Err(Error::Protocol("data frame inside fragmented message"));
        }

        let opcode = frame.header.opcode;
        let compressed = frame.header.rsv1;

        if frame.header.fin {
            let payload = self.finish_payload(state, frame.payload, compressed, opcode, false)?;
            self.deliver(opcode, payload);
            return Ok(Flow::Continue);
        }

        let mut utf8 = Utf8Validator::new();
        if opcode == OpCode::Text && !compressed && self.config.check_utf8_enabled {
            if !utf8.update(&frame.payload) {
                return Err(Error::InvalidUtf8);
            }
        }

        let mut buf = pool::global().get(frame.payload.len().max(RECV_CHUNK_SIZE));
        buf.extend_from_slice(&frame.payload);
        pool::global().put(frame.payload);

        state.continuation = Some(Continuation {
            opcode,
            buf,
            compressed,
            utf8,
        });
        Ok(Flow::Continue)
    }

    fn on_continuation(self: &Arc<Self>, state: &mut ReadState, frame: Frame) -> Result<Flow> {
        let Some(cont) = state.continuation.as_mut() else {
            return Err(Error::Protocol("continuation without a message"));
        };

        if cont.buf.len() + frame.payload.len() > self.config.read_max_payload_size {
            return Err(Error::MessageTooLarge);
        }
        cont.buf.extend_from_slice(&frame.payload);

        if cont.opcode == OpCode::Text && !cont.compressed && self.config.check_utf8_enabled {
            if !cont.utf8.update(&frame.payload) {
                return Err(Error::InvalidUtf8);
            }
        }
        pool::global().put(frame.payload);

        if !frame.header.fin {
            return Ok(Flow::Continue);
        }

        let Some(mut cont) = state.continuation.take() else {
            return Err(Error::Protocol("continuation without a message"));
        };
        let incremental = cont.opcode == OpCode::Text && !cont.compressed;
        if incremental && self.config.check_utf8_enabled && !cont.utf8.finish() {
            return Err(Error::InvalidUtf8);
        }

        let payload =
            self.finish_payload(state, cont.buf, cont.compressed, cont.opcode, incremental)?;
        self.deliver(cont.opcode, payload);
        Ok(Flow::Continue)
    }

    /// Inflate and validate a completed message body. `utf8_done` marks
    /// text that the fragment path already validated incrementally.
    fn finish_payload(
        &self,
        state: &mut ReadState,
        payload: BytesMut,
        compressed: bool,
        opcode: OpCode,
        utf8_done: bool,
    ) -> Result<Bytes> {
        let payload = if compressed {
            let decompressor = state
                .decompressor
                .as_mut()
                .ok_or(Error::Protocol("compressed frame without extension"))?;
            let inflated = decompressor.decompress(
                &payload,
                self.config.read_max_payload_size,
                pool::global(),
            )?;
            pool::global().put(payload);
            inflated
        } else {
            payload
        };

        if opcode == OpCode::Text && self.config.check_utf8_enabled && !utf8_done {
            let valid = if compressed {
                // Text that streamed through the decompressor goes through
                // the DFA; a plain single frame takes the SIMD fast path.
                let mut validator = Utf8Validator::new();
                validator.update(&payload) && validator.finish()
            } else {
                validate_utf8(&payload)
            };
            if !valid {
                return Err(Error::InvalidUtf8);
            }
        }

        Ok(payload.freeze())
    }

    fn deliver(self: &Arc<Self>, opcode: OpCode, payload: Bytes) {
        let message = match opcode {
            OpCode::Text => Message::Text(payload),
            _ => Message::Binary(payload),
        };

        if self.config.read_async_enabled {
            let conn = self.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                handler.on_message(&conn, message);
            });
        } else {
            self.handler.on_message(self, message);
        }
    }

    // ------------------------------------------------------------------
    // Write side
    // ------------------------------------------------------------------

    /// Write one message and wait for the transport write to finish.
    ///
    /// Frames from concurrent writers are serialized; a failure here closes
    /// the connection with the mapped close code.
    pub async fn write_message(self: &Arc<Self>, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnClosed);
        }

        let frame = match self.gen_frame(opcode, payload) {
            Ok(frame) => frame,
            Err(err) => {
                self.emit(&err).await;
                return Err(err);
            }
        };

        let result = self.write_frame_now(&frame).await;
        pool::global().put(frame);

        if let Err(err) = result {
            self.emit(&err).await;
            return Err(err);
        }
        Ok(())
    }

    /// Write a text message.
    pub async fn write_text(self: &Arc<Self>, text: &str) -> Result<()> {
        self.write_message(OpCode::Text, text.as_bytes()).await
    }

    /// Write a binary message.
    pub async fn write_binary(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Binary, payload).await
    }

    /// Write a ping. The payload must fit in a control frame (≤ 125 bytes).
    pub async fn write_ping(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Ping, payload).await
    }

    /// Write a pong.
    pub async fn write_pong(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Pong, payload).await
    }

    /// Build the frame now, write it later.
    ///
    /// Enqueued frames are written in FIFO order by a single consumer.
    /// Frame-build failures are reported through the close path after
    /// earlier jobs have drained.
    pub fn write_async(self: &Arc<Self>, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnClosed);
        }

        match self.gen_frame(opcode, payload) {
            Ok(frame) => self
                .jobs
                .send(WriteJob::Frame(frame))
                .map_err(|_| Error::ConnClosed),
            Err(err) => {
                let _ = self.jobs.send(WriteJob::Shutdown(err.clone()));
                Err(err)
            }
        }
    }

    /// Initiate the close protocol: send a close frame with `code` and
    /// `reason`, then report [`Error::Closed`] to the handler.
    ///
    /// The write lock is taken even while another path already moved the
    /// connection into `Closing`, so the final close frame can still go out.
    pub async fn close(self: &Arc<Self>, code: u16, reason: &[u8]) -> Result<()> {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return Err(Error::ConnClosed);
        }

        self.status.store(STATUS_CLOSING, Ordering::SeqCst);
        self.shutdown.notify_one();
        let payload = build_close_payload(code, reason);
        let result = self.send_close_frame(&payload).await;
        self.status.store(STATUS_CLOSED, Ordering::SeqCst);

        let reason = CloseReason::new(code, String::from_utf8_lossy(&payload[2..]).into_owned());
        self.handler.on_close(self, &Error::Closed(Some(reason)));
        result
    }

    /// Encode one frame for `opcode`/`payload` per this connection's
    /// negotiated state. Compressed frames reserve the maximum header up
    /// front and slice it down once the compressed size is known.
    pub(crate) fn gen_frame(&self, opcode: OpCode, payload: &[u8]) -> Result<BytesMut> {
        if opcode == OpCode::Text && self.config.check_utf8_enabled && !validate_utf8(payload) {
            return Err(Error::InvalidUtf8);
        }
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("oversized control frame"));
        }

        if let Some(compressor) = &self.compressor {
            if opcode.is_data() && payload.len() >= self.config.compress_threshold {
                return self.gen_compressed_frame(compressor, opcode, payload);
            }
        }

        if payload.len() > self.config.write_max_payload_size {
            return Err(Error::MessageTooLarge);
        }

        let mut frame = pool::global().get(MAX_HEADER_SIZE + payload.len());
        encode_frame(
            &mut frame,
            self.role.is_server(),
            true,
            false,
            opcode,
            payload,
        );
        Ok(frame)
    }

    fn gen_compressed_frame(
        &self,
        compressor: &SyncMutex<DeflateEncoder>,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<BytesMut> {
        let mut frame = pool::global().get(MAX_HEADER_SIZE + payload.len() / 2 + 64);
        frame.resize(MAX_HEADER_SIZE, 0);
        compressor.lock().compress_into(payload, &mut frame)?;

        let body_len = frame.len() - MAX_HEADER_SIZE;
        if body_len > self.config.write_max_payload_size {
            return Err(Error::MessageTooLarge);
        }

        let mut header = [0u8; MAX_HEADER_SIZE];
        let (header_len, mask) = generate_header(
            self.role.is_server(),
            true,
            true,
            opcode,
            body_len,
            &mut header,
        );
        if let Some(key) = mask {
            apply_mask(&mut frame[MAX_HEADER_SIZE..], key);
        }
        frame[MAX_HEADER_SIZE - header_len..MAX_HEADER_SIZE]
            .copy_from_slice(&header[..header_len]);
        frame.advance(MAX_HEADER_SIZE - header_len);
        Ok(frame)
    }

    async fn write_frame_now(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.write.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_close_frame(&self, payload: &[u8]) -> Result<()> {
        let mut frame = pool::global().get(MAX_HEADER_SIZE + payload.len());
        encode_frame(
            &mut frame,
            self.role.is_server(),
            true,
            false,
            OpCode::Close,
            payload,
        );
        let result = self.write_frame_now(&frame).await;
        pool::global().put(frame);
        result
    }

    pub(crate) fn enqueue_broadcast(
        &self,
        frame: Bytes,
        shared: Arc<Broadcaster>,
    ) -> Result<()> {
        self.jobs
            .send(WriteJob::Broadcast { frame, shared })
            .map_err(|_| Error::ConnClosed)
    }

    /// Terminate the connection with `err`: best-effort close frame,
    /// transport half-close, `on_close` exactly once.
    pub(crate) async fn emit(self: &Arc<Self>, err: &Error) {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.store(STATUS_CLOSING, Ordering::SeqCst);
        self.shutdown.notify_one();
        debug!(role = ?self.role, error = %err, "closing connection");

        match err {
            // Transport already failed; nothing more to send.
            Error::ConnClosed | Error::Io(_) => {}
            // Peer sent close: echo it back.
            Error::Closed(reason) => {
                let payload = match reason {
                    Some(r) => build_close_payload(r.code, r.reason.as_bytes()),
                    None => BytesMut::new(),
                };
                let _ = self.send_close_frame(&payload).await;
            }
            other => {
                let text = other.to_string();
                let payload = build_close_payload(other.wire_close_code(), text.as_bytes());
                let _ = self.send_close_frame(&payload).await;
            }
        }

        self.status.store(STATUS_CLOSED, Ordering::SeqCst);
        {
            let mut writer = self.write.lock().await;
            let _ = writer.shutdown().await;
        }
        self.handler.on_close(self, err);
    }
}

/// Single consumer of a connection's write queue.
async fn drain_write_queue(
    conn: Weak<Conn>,
    write: Arc<AsyncMutex<WriteHalf<BoxTransport>>>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Frame(frame) => {
                let outcome = match conn.upgrade() {
                    Some(c) if !c.is_closed() => {
                        let mut writer = write.lock().await;
                        let res = writer.write_all(&frame).await;
                        match res {
                            Ok(()) => writer.flush().await,
                            Err(e) => Err(e),
                        }
                    }
                    _ => Ok(()),
                };
                pool::global().put(frame);

                if let Err(e) = outcome {
                    if let Some(c) = conn.upgrade() {
                        c.emit(&Error::from(e)).await;
                    }
                }
            }
            WriteJob::Broadcast { frame, shared } => {
                if let Some(c) = conn.upgrade() {
                    if !c.is_closed() {
                        let mut writer = write.lock().await;
                        let res = writer.write_all(&frame).await;
                        let res = match res {
                            Ok(()) => writer.flush().await,
                            Err(e) => Err(e),
                        };
                        drop(writer);
                        if let Err(e) = res {
                            c.emit(&Error::from(e)).await;
                        }
                    }
                }
                // Always reported, even when the write was skipped, so the
                // broadcaster's refcount can reach zero.
                shared.complete();
            }
            WriteJob::Shutdown(err) => {
                if let Some(c) = conn.upgrade() {
                    c.emit(&err).await;
                }
            }
        }
    }
}
