//! RFC 6455 frame codec
//!
//! Header layout (2–14 bytes):
//!
//! ```text
//! byte 0: FIN | RSV1 | RSV2 | RSV3 | opcode(4)
//! byte 1: MASK | length(7)           125 => inline, 126 => +u16, 127 => +u64
//! then:   extended length (big-endian), then 4-byte mask key if masked
//! ```
//!
//! The parser is incremental over a growing input buffer: it returns
//! `Ok(None)` until a complete frame is available, then consumes exactly
//! that frame. Payloads are drawn from the buffer pool and unmasked in
//! place.

use bytes::{Buf, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::{apply_mask, generate_mask};
use crate::pool::BufferPool;
use crate::utf8::validate_utf8;
use crate::{LEN16_THRESHOLD, LEN64_THRESHOLD, MAX_HEADER_SIZE};

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation = 0x0,
    /// UTF-8 text message
    Text = 0x1,
    /// Binary message
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Close, Ping and Pong are control frames
    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) >= 0x8
    }

    /// Text and Binary carry application data
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// Parsed frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Compression indicator; RSV2/RSV3 are rejected by the parser
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag; true exactly for client-to-server frames
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key when `masked`
    pub mask: Option<[u8; 4]>,
}

/// A complete frame with its payload already unmasked
#[derive(Debug)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Unmasked payload, drawn from the buffer pool
    pub payload: BytesMut,
}

/// Encode a frame header into `out`, returning the encoded length and the
/// mask key that the payload must be XORed with.
///
/// Server frames are never masked; client frames always are, with a fresh
/// non-predictable key. The 8-byte length form keeps its high bit zero by
/// construction (payload lengths are `usize`).
pub fn generate_header(
    is_server: bool,
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    payload_len: usize,
    out: &mut [u8; MAX_HEADER_SIZE],
) -> (usize, Option<[u8; 4]>) {
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    out[0] = b0;

    let mask_bit = if is_server { 0x00 } else { 0x80 };
    let mut n = 2;

    if payload_len <= LEN16_THRESHOLD {
        out[1] = mask_bit | payload_len as u8;
    } else if payload_len <= LEN64_THRESHOLD {
        out[1] = mask_bit | 126;
        out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        n = 4;
    } else {
        out[1] = mask_bit | 127;
        out[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        n = 10;
    }

    if is_server {
        (n, None)
    } else {
        let key = generate_mask();
        out[n..n + 4].copy_from_slice(&key);
        (n + 4, Some(key))
    }
}

/// Append a complete frame (header plus payload) to `buf`, masking the
/// payload when encoding from the client side.
pub fn encode_frame(
    buf: &mut BytesMut,
    is_server: bool,
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    payload: &[u8],
) {
    let mut header = [0u8; MAX_HEADER_SIZE];
    let (header_len, mask) = generate_header(is_server, fin, rsv1, opcode, payload.len(), &mut header);

    buf.reserve(header_len + payload.len());
    buf.extend_from_slice(&header[..header_len]);

    let start = buf.len();
    buf.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut buf[start..], key);
    }
}

/// Incremental frame parser
///
/// One instance lives inside each connection's read state. The parser is
/// stateless between frames; partial input simply stays in the caller's
/// buffer until more bytes arrive.
pub struct FrameParser {
    /// Upper bound on a single frame's payload
    limit: usize,
    /// Servers require masked input, clients require unmasked input
    expect_masked: bool,
    /// RSV1 is legal only once permessage-deflate was negotiated
    allow_rsv1: bool,
}

impl FrameParser {
    /// Create a parser for one side of a connection.
    pub fn new(limit: usize, expect_masked: bool, allow_rsv1: bool) -> Self {
        Self {
            limit,
            expect_masked,
            allow_rsv1,
        }
    }

    /// Try to parse one frame from `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; nothing is consumed in that case.
    pub fn parse(&self, buf: &mut BytesMut, pool: &BufferPool) -> Result<Option<Frame>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        if b0 & 0x30 != 0 {
            return Err(Error::Protocol("RSV2 and RSV3 must be zero"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("unknown opcode"))?;

        if rsv1 {
            if !self.allow_rsv1 {
                return Err(Error::Protocol("RSV1 set without negotiated extension"));
            }
            // Compression is flagged on the first data frame only
            if opcode.is_control() || opcode == OpCode::Continuation {
                return Err(Error::Protocol("RSV1 set on non-data frame"));
            }
        }

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("fragmented control frame"));
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(Error::Protocol("unmasked frame from client"));
        }
        if !self.expect_masked && masked {
            return Err(Error::Protocol("masked frame from server"));
        }

        let (payload_len, base_len) = match b1 & 0x7F {
            n @ 0..=125 => (n as u64, 2),
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len <= LEN16_THRESHOLD as u64 {
                    return Err(Error::Protocol("extended length not minimal"));
                }
                (len, 4)
            }
            _ => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len <= LEN64_THRESHOLD as u64 {
                    return Err(Error::Protocol("extended length not minimal"));
                }
                if len >> 63 != 0 {
                    return Err(Error::Protocol("length high bit set"));
                }
                (len, 10)
            }
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("oversized control frame"));
        }
        if payload_len > self.limit as u64 {
            return Err(Error::MessageTooLarge);
        }

        let header_len = base_len + if masked { 4 } else { 0 };
        let total = header_len + payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mask = masked.then(|| {
            [
                buf[base_len],
                buf[base_len + 1],
                buf[base_len + 2],
                buf[base_len + 3],
            ]
        });

        buf.advance(header_len);
        let mut payload = pool.get(payload_len as usize);
        payload.extend_from_slice(&buf[..payload_len as usize]);
        buf.advance(payload_len as usize);

        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            header: FrameHeader {
                fin,
                rsv1,
                opcode,
                masked,
                payload_len,
                mask,
            },
            payload,
        }))
    }
}

/// Parse a close frame payload into its status code and reason.
///
/// An empty payload is a close without status. A single byte cannot encode
/// a status code and is a protocol error, as is a code that must not appear
/// on the wire or a reason that is not UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_wire_code(code) {
                return Err(Error::Protocol("invalid close code"));
            }
            let reason = &payload[2..];
            if !validate_utf8(reason) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(CloseReason::new(
                code,
                String::from_utf8_lossy(reason).into_owned(),
            )))
        }
    }
}

/// Build a close frame payload. The reason is truncated to the 123 bytes a
/// control frame can carry alongside the status code.
pub fn build_close_payload(code: u16, reason: &[u8]) -> BytesMut {
    let reason = &reason[..reason.len().min(MAX_CONTROL_PAYLOAD - 2)];
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn parse_all(parser: &FrameParser, raw: &[u8]) -> Result<Option<Frame>> {
        let pool = BufferPool::new();
        let mut buf = BytesMut::from(raw);
        parser.parse(&mut buf, &pool)
    }

    #[test]
    fn test_opcode_classes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(!OpCode::Continuation.is_data());
        assert!(!OpCode::Continuation.is_control());
        assert!(OpCode::from_u8(0x3).is_none());
        assert!(OpCode::from_u8(0xB).is_none());
    }

    #[test]
    fn test_header_roundtrip() {
        let pool = BufferPool::new();
        let cases: &[(bool, bool, OpCode, usize)] = &[
            (true, false, OpCode::Text, 0),
            (true, false, OpCode::Binary, 125),
            (true, true, OpCode::Text, 126),
            (false, false, OpCode::Binary, 65535),
            (true, false, OpCode::Binary, 65536),
            (true, true, OpCode::Text, 1 << 20),
        ];

        for &(fin, rsv1, opcode, len) in cases {
            for is_server in [true, false] {
                let mut header = [0u8; MAX_HEADER_SIZE];
                let (header_len, mask) =
                    generate_header(is_server, fin, rsv1, opcode, len, &mut header);

                let payload = vec![0xABu8; len];
                let mut wire = BytesMut::new();
                wire.extend_from_slice(&header[..header_len]);
                let start = wire.len();
                wire.extend_from_slice(&payload);
                if let Some(key) = mask {
                    apply_mask(&mut wire[start..], key);
                }

                // The receiver of a client frame expects masking and vice versa
                let parser = FrameParser::new(1 << 21, !is_server, true);
                let frame = parser.parse(&mut wire, &pool).unwrap().unwrap();
                assert!(wire.is_empty());
                assert_eq!(frame.header.fin, fin);
                assert_eq!(frame.header.rsv1, rsv1);
                assert_eq!(frame.header.opcode, opcode);
                assert_eq!(frame.header.masked, !is_server);
                assert_eq!(frame.header.payload_len, len as u64);
                assert_eq!(frame.payload.as_ref(), &payload[..]);
            }
        }
    }

    #[test]
    fn test_parse_needs_more_data() {
        let pool = BufferPool::new();
        let parser = FrameParser::new(1024, false, false);

        let mut full = BytesMut::new();
        encode_frame(&mut full, true, true, false, OpCode::Text, b"hello");

        // Every prefix short of the full frame yields None and consumes nothing
        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            let before = buf.len();
            assert!(parser.parse(&mut buf, &pool).unwrap().is_none());
            assert_eq!(buf.len(), before);
        }

        let mut buf = full.clone();
        let frame = parser.parse(&mut buf, &pool).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn test_parse_two_frames_back_to_back() {
        let pool = BufferPool::new();
        let parser = FrameParser::new(1024, false, false);

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, true, true, false, OpCode::Text, b"one");
        encode_frame(&mut buf, true, true, false, OpCode::Binary, b"two");

        let a = parser.parse(&mut buf, &pool).unwrap().unwrap();
        assert_eq!(a.payload.as_ref(), b"one");
        let b = parser.parse(&mut buf, &pool).unwrap().unwrap();
        assert_eq!(b.header.opcode, OpCode::Binary);
        assert_eq!(b.payload.as_ref(), b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rsv_rejection() {
        let parser = FrameParser::new(1024, false, false);
        assert!(matches!(
            parse_all(&parser, &[0xA1, 0x00]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            parse_all(&parser, &[0x91, 0x00]),
            Err(Error::Protocol(_))
        ));
        // RSV1 without negotiation
        assert!(matches!(
            parse_all(&parser, &[0xC1, 0x00]),
            Err(Error::Protocol(_))
        ));

        // RSV1 allowed on data frames once negotiated, but not on control
        // frames or continuations
        let compressed = FrameParser::new(1024, false, true);
        assert!(parse_all(&compressed, &[0xC1, 0x00]).unwrap().is_some());
        assert!(matches!(
            parse_all(&compressed, &[0xC9, 0x00]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            parse_all(&compressed, &[0xC0, 0x00]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_control_frame_rules() {
        let parser = FrameParser::new(1024, false, false);
        // Ping without FIN
        assert!(matches!(
            parse_all(&parser, &[0x09, 0x00]),
            Err(Error::Protocol(_))
        ));
        // Ping with 126-byte payload
        let mut raw = vec![0x89, 126, 0x00, 126];
        raw.extend_from_slice(&[0u8; 126]);
        assert!(matches!(parse_all(&parser, &raw), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_masking_direction() {
        // Server expects masked input
        let server = FrameParser::new(1024, true, false);
        assert!(matches!(
            parse_all(&server, &[0x81, 0x01, b'a']),
            Err(Error::Protocol(_))
        ));

        // Client expects unmasked input
        let client = FrameParser::new(1024, false, false);
        assert!(matches!(
            parse_all(&client, &[0x81, 0x81, 1, 2, 3, 4, b'a']),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_non_minimal_lengths() {
        let parser = FrameParser::new(1 << 20, false, false);

        let mut short16 = vec![0x82, 126, 0x00, 125];
        short16.extend_from_slice(&[0u8; 125]);
        assert!(matches!(
            parse_all(&parser, &short16),
            Err(Error::Protocol(_))
        ));

        let mut short64 = vec![0x82, 127];
        short64.extend_from_slice(&65535u64.to_be_bytes());
        short64.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            parse_all(&parser, &short64),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_length_high_bit() {
        let parser = FrameParser::new(usize::MAX, false, false);
        let mut raw = vec![0x82, 127];
        raw.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(matches!(parse_all(&parser, &raw), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_payload_limit() {
        let parser = FrameParser::new(16, false, false);
        let raw = [&[0x82, 17][..], &[0u8; 17][..]].concat();
        assert!(matches!(
            parse_all(&parser, &raw),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_close_payload_roundtrip() {
        let payload = build_close_payload(1000, b"goodbye");
        let reason = parse_close_payload(&payload).unwrap().unwrap();
        assert_eq!(reason.code, 1000);
        assert_eq!(reason.reason, "goodbye");

        assert!(parse_close_payload(&[]).unwrap().is_none());
        assert!(matches!(
            parse_close_payload(&[0x03]),
            Err(Error::Protocol(_))
        ));
        // 1005 must not appear on the wire
        assert!(matches!(
            parse_close_payload(&1005u16.to_be_bytes()),
            Err(Error::Protocol(_))
        ));
        // Reason must be UTF-8
        let bad = [&1000u16.to_be_bytes()[..], &[0xC3, 0x28][..]].concat();
        assert!(matches!(parse_close_payload(&bad), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_close_reason_truncated() {
        let long = vec![b'x'; 200];
        let payload = build_close_payload(1001, &long);
        assert_eq!(payload.len(), 2 + 123);
    }
}
