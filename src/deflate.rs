//! permessage-deflate (RFC 7692)
//!
//! A connection that negotiated the extension owns one long-lived raw
//! deflate stream per direction. Messages are emitted as sync-flushed
//! blocks with the trailing `00 00 FF FF` stripped; inbound payloads get
//! the tail re-appended before inflating. Unless the peer asked for
//! `no_context_takeover` for our role, the LZ77 window survives across
//! messages, which is where the compression ratio on repetitive traffic
//! comes from.

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// Sync-flush tail stripped after compression and restored before inflation
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Default LZ77 window (2^15 = 32 KB)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Smallest negotiable window (2^8 = 256 B)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Largest negotiable window
pub const MAX_WINDOW_BITS: u8 = 15;

/// Scratch chunk for streaming through flate2
const CHUNK: usize = 8 * 1024;

/// Negotiated permessage-deflate parameters plus local tuning.
///
/// The four `server_*`/`client_*` fields are exactly the RFC 7692
/// negotiation parameters; `level` and `threshold` are local policy and
/// never appear on the wire.
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    /// Window bits for the server's compressor
    pub server_max_window_bits: u8,
    /// Window bits for the client's compressor
    pub client_max_window_bits: u8,
    /// Server resets its compression context after every message
    pub server_no_context_takeover: bool,
    /// Client resets its compression context after every message
    pub client_no_context_takeover: bool,
    /// Deflate level, 1–9
    pub level: u32,
    /// Data frames below this length are sent uncompressed
    pub threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            level: 6,
            threshold: 512,
        }
    }
}

impl DeflateConfig {
    /// Fold one parameter list from a `permessage-deflate` offer into this
    /// config. Errors reject the whole offer.
    pub fn apply_params(&mut self, params: &[(&str, Option<&str>)]) -> Result<()> {
        for (name, value) in params {
            match *name {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::Handshake(
                            "server_no_context_takeover takes no value",
                        ));
                    }
                    self.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::Handshake(
                            "client_no_context_takeover takes no value",
                        ));
                    }
                    self.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let v = value.ok_or(Error::Handshake("server_max_window_bits needs a value"))?;
                    self.server_max_window_bits = parse_window_bits(v)?;
                }
                "client_max_window_bits" => {
                    // A bare client_max_window_bits is a declaration of
                    // support; a valued one constrains our echo.
                    if let Some(v) = value {
                        self.client_max_window_bits = parse_window_bits(v)?;
                    }
                }
                _ => return Err(Error::Handshake("unknown permessage-deflate parameter")),
            }
        }
        Ok(())
    }

    /// Render the server's `Sec-WebSocket-Extensions` response value.
    pub fn response_value(&self) -> String {
        let mut out = String::from("permessage-deflate");
        if self.server_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            out.push_str(&format!(
                "; server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            out.push_str(&format!(
                "; client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }
        out
    }

    /// Render the client's `Sec-WebSocket-Extensions` offer value.
    pub fn offer_value(&self) -> String {
        // The bare parameter tells the server it may pick a client window
        let mut out = String::from("permessage-deflate; client_max_window_bits");
        if self.server_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }
        out
    }

    /// Compressor for our side of the connection.
    pub fn encoder(&self, is_server: bool) -> DeflateEncoder {
        if is_server {
            DeflateEncoder::new(
                self.server_max_window_bits,
                self.server_no_context_takeover,
                self.level,
            )
        } else {
            DeflateEncoder::new(
                self.client_max_window_bits,
                self.client_no_context_takeover,
                self.level,
            )
        }
    }

    /// Decompressor for the peer's direction.
    pub fn decoder(&self, is_server: bool) -> DeflateDecoder {
        if is_server {
            DeflateDecoder::new(
                self.client_max_window_bits,
                self.client_no_context_takeover,
            )
        } else {
            DeflateDecoder::new(
                self.server_max_window_bits,
                self.server_no_context_takeover,
            )
        }
    }
}

fn parse_window_bits(v: &str) -> Result<u8> {
    let bits: u8 = v
        .trim_matches('"')
        .parse()
        .map_err(|_| Error::Handshake("malformed max_window_bits value"))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::Handshake("max_window_bits out of range"));
    }
    Ok(bits)
}

/// Split an extension header into its comma-separated offers, each offer
/// into `(name, value)` parameters. Returns the parameter lists of every
/// `permessage-deflate` offer, in order.
pub fn deflate_offers(header: &str) -> Vec<Vec<(&str, Option<&str>)>> {
    let mut offers = Vec::new();

    for offer in header.split(',') {
        let mut parts = offer.split(';').map(str::trim);
        match parts.next() {
            Some("permessage-deflate") => {}
            _ => continue,
        }

        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (p, None),
            })
            .collect();
        offers.push(params);
    }

    offers
}

/// Long-lived compressor, one per connection.
pub struct DeflateEncoder {
    stream: Compress,
    reset_per_message: bool,
}

impl DeflateEncoder {
    /// Create a raw-deflate compressor with the negotiated window.
    pub fn new(window_bits: u8, reset_per_message: bool, level: u32) -> Self {
        Self {
            stream: Compress::new_with_window_bits(Compression::new(level), false, window_bits),
            reset_per_message,
        }
    }

    /// Compress one message, appending the output to `out` and stripping
    /// the sync-flush tail.
    pub fn compress_into(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        if self.reset_per_message {
            self.stream.reset();
        }

        let mut chunk = [0u8; CHUNK];
        let mut consumed: usize = 0;
        let start = out.len();
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            if rounds > 100_000 {
                return Err(Error::Compression("deflate made no progress".into()));
            }

            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self
                .stream
                .compress(&data[consumed..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate: {}", e)))?;

            consumed += (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);

            match status {
                Status::Ok | Status::BufError => {
                    // Sync flush is complete once the input is consumed and
                    // the last call had spare output room
                    if consumed >= data.len() && produced < chunk.len() {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        if out[start..].ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        Ok(())
    }

    /// Compress into a fresh pooled buffer.
    pub fn compress(&mut self, data: &[u8], pool: &BufferPool) -> Result<BytesMut> {
        let mut out = pool.get(data.len() / 2 + 64);
        self.compress_into(data, &mut out)?;
        Ok(out)
    }

    /// Drop the sliding window.
    pub fn reset(&mut self) {
        self.stream.reset();
    }
}

/// Long-lived decompressor, one per connection.
pub struct DeflateDecoder {
    stream: Decompress,
    reset_per_message: bool,
}

impl DeflateDecoder {
    /// Create a raw-inflate stream with the negotiated window.
    pub fn new(window_bits: u8, reset_per_message: bool) -> Self {
        Self {
            stream: Decompress::new_with_window_bits(false, window_bits),
            reset_per_message,
        }
    }

    /// Inflate one message payload into a pooled buffer.
    ///
    /// The sync-flush tail is re-appended before inflating. Output is
    /// capped at `limit`; exceeding it is `MessageTooLarge`.
    pub fn decompress(&mut self, data: &[u8], limit: usize, pool: &BufferPool) -> Result<BytesMut> {
        if self.reset_per_message {
            self.stream.reset(false);
        }

        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = pool.get((data.len() * 2).max(256).min(limit.max(256)));
        let mut chunk = [0u8; CHUNK];
        let mut consumed: usize = 0;
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            if rounds > 100_000 {
                return Err(Error::Compression("inflate made no progress".into()));
            }

            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self
                .stream
                .decompress(&input[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate: {}", e)))?;

            consumed += (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;

            if out.len() + produced > limit {
                return Err(Error::MessageTooLarge);
            }
            out.extend_from_slice(&chunk[..produced]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed >= input.len() && produced < chunk.len() {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Drop the sliding window.
    pub fn reset(&mut self) {
        self.stream.reset(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DeflateEncoder, DeflateDecoder) {
        (
            DeflateEncoder::new(15, false, 6),
            DeflateDecoder::new(15, false),
        )
    }

    #[test]
    fn test_roundtrip() {
        let pool = BufferPool::new();
        let (mut enc, mut dec) = pair();

        let msg = b"Hello, World! This message is long enough to exercise deflate.";
        let compressed = enc.compress(msg, &pool).unwrap();
        assert!(!compressed.ends_with(&DEFLATE_TAIL));

        let plain = dec.decompress(&compressed, 1 << 16, &pool).unwrap();
        assert_eq!(plain.as_ref(), msg);
    }

    #[test]
    fn test_roundtrip_large() {
        let pool = BufferPool::new();
        let (mut enc, mut dec) = pair();

        let msg: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = enc.compress(&msg, &pool).unwrap();
        let plain = dec.decompress(&compressed, 1 << 20, &pool).unwrap();
        assert_eq!(plain.as_ref(), &msg[..]);
    }

    #[test]
    fn test_context_takeover_shrinks_repeats() {
        let pool = BufferPool::new();
        let (mut enc, mut dec) = pair();

        let msg = b"the quick brown fox jumps over the lazy dog";
        let first = enc.compress(msg, &pool).unwrap();
        let second = enc.compress(msg, &pool).unwrap();

        // The second message back-references the retained window
        assert!(second.len() < first.len());

        assert_eq!(dec.decompress(&first, 1 << 16, &pool).unwrap().as_ref(), &msg[..]);
        assert_eq!(dec.decompress(&second, 1 << 16, &pool).unwrap().as_ref(), &msg[..]);
    }

    #[test]
    fn test_no_context_takeover_is_stable() {
        let pool = BufferPool::new();
        let mut enc = DeflateEncoder::new(15, true, 6);
        let mut dec = DeflateDecoder::new(15, true);

        let msg = b"the quick brown fox jumps over the lazy dog";
        let first = enc.compress(msg, &pool).unwrap();
        let second = enc.compress(msg, &pool).unwrap();
        assert_eq!(first, second);

        assert_eq!(dec.decompress(&first, 1 << 16, &pool).unwrap().as_ref(), &msg[..]);
        assert_eq!(dec.decompress(&second, 1 << 16, &pool).unwrap().as_ref(), &msg[..]);
    }

    #[test]
    fn test_stream_of_messages_roundtrips() {
        let pool = BufferPool::new();
        let (mut enc, mut dec) = pair();

        let messages: Vec<Vec<u8>> = (0..10)
            .map(|i| format!("message number {} with shared vocabulary", i).into_bytes())
            .collect();

        for msg in &messages {
            let compressed = enc.compress(msg, &pool).unwrap();
            let plain = dec.decompress(&compressed, 1 << 16, &pool).unwrap();
            assert_eq!(plain.as_ref(), &msg[..]);
        }
    }

    #[test]
    fn test_decompress_limit() {
        let pool = BufferPool::new();
        let (mut enc, mut dec) = pair();

        let msg = vec![b'a'; 100_000];
        let compressed = enc.compress(&msg, &pool).unwrap();
        assert!(matches!(
            dec.decompress(&compressed, 1024, &pool),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_decompress_garbage() {
        let pool = BufferPool::new();
        let mut dec = DeflateDecoder::new(15, false);
        let garbage = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03];
        assert!(dec.decompress(&garbage, 1 << 16, &pool).is_err());
    }

    #[test]
    fn test_offer_parsing() {
        let offers = deflate_offers("permessage-deflate");
        assert_eq!(offers.len(), 1);
        assert!(offers[0].is_empty());

        let offers = deflate_offers(
            "permessage-deflate; client_max_window_bits; server_no_context_takeover",
        );
        assert_eq!(
            offers[0],
            vec![
                ("client_max_window_bits", None),
                ("server_no_context_takeover", None)
            ]
        );

        // Multiple offers: unknown extension skipped, both pmd offers kept
        let offers = deflate_offers(
            "x-webkit-deflate-frame, permessage-deflate; server_max_window_bits=10, permessage-deflate",
        );
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0], vec![("server_max_window_bits", Some("10"))]);
        assert!(offers[1].is_empty());
    }

    #[test]
    fn test_apply_params() {
        let mut config = DeflateConfig::default();
        config
            .apply_params(&[
                ("server_no_context_takeover", None),
                ("client_max_window_bits", Some("12")),
            ])
            .unwrap();
        assert!(config.server_no_context_takeover);
        assert!(!config.client_no_context_takeover);
        assert_eq!(config.client_max_window_bits, 12);
        assert_eq!(config.server_max_window_bits, DEFAULT_WINDOW_BITS);

        let mut config = DeflateConfig::default();
        assert!(config
            .apply_params(&[("server_max_window_bits", Some("16"))])
            .is_err());
        assert!(config
            .apply_params(&[("server_max_window_bits", Some("7"))])
            .is_err());
        assert!(config.apply_params(&[("bogus", None)]).is_err());
        assert!(config
            .apply_params(&[("server_no_context_takeover", Some("yes"))])
            .is_err());
    }

    #[test]
    fn test_response_value() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            server_max_window_bits: 12,
            ..Default::default()
        };
        let value = config.response_value();
        assert!(value.starts_with("permessage-deflate"));
        assert!(value.contains("server_no_context_takeover"));
        assert!(value.contains("server_max_window_bits=12"));
        assert!(!value.contains("client_no_context_takeover"));
    }

    #[test]
    fn test_role_mapping() {
        let config = DeflateConfig {
            server_max_window_bits: 11,
            client_max_window_bits: 9,
            server_no_context_takeover: true,
            client_no_context_takeover: false,
            ..Default::default()
        };
        let pool = BufferPool::new();

        // Server compresses with its own window, client inflates with it
        let mut server_enc = config.encoder(true);
        let mut client_dec = config.decoder(false);
        let msg = b"role mapping check with enough length to compress";
        let compressed = server_enc.compress(msg, &pool).unwrap();
        let plain = client_dec.decompress(&compressed, 1 << 16, &pool).unwrap();
        assert_eq!(plain.as_ref(), &msg[..]);

        // And the reverse direction
        let mut client_enc = config.encoder(false);
        let mut server_dec = config.decoder(true);
        let compressed = client_enc.compress(msg, &pool).unwrap();
        let plain = server_dec.decompress(&compressed, 1 << 16, &pool).unwrap();
        assert_eq!(plain.as_ref(), &msg[..]);
    }
}
