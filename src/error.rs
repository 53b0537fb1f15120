//! Error types and close-code mapping

use std::fmt;
use std::io;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket engine error
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// The upgrade exchange failed; the message names the offending header
    Handshake(&'static str),
    /// Malformed or rule-violating frame
    Protocol(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// A message exceeds a configured size bound
    MessageTooLarge,
    /// The application rejected the message
    PolicyViolation(&'static str),
    /// Deflate or inflate failure
    Compression(String),
    /// Write attempted on a closing or closed connection
    ConnClosed,
    /// The peer closed the connection; carries the parsed close frame
    Closed(Option<CloseReason>),
}

impl Error {
    /// The close code associated with this error. `Io` maps to 1006, which
    /// is synthesized locally and never transmitted.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => CloseReason::PROTOCOL_ERROR,
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge => CloseReason::TOO_BIG,
            Error::PolicyViolation(_) => CloseReason::POLICY,
            Error::Compression(_) => CloseReason::INTERNAL,
            Error::Io(_) | Error::ConnClosed => CloseReason::ABNORMAL,
            Error::Handshake(_) => CloseReason::PROTOCOL_ERROR,
            Error::Closed(Some(r)) => r.code,
            Error::Closed(None) => CloseReason::NO_STATUS,
        }
    }

    /// Close code usable in an outgoing close frame. Locally synthesized
    /// codes (1005, 1006) must not appear on the wire.
    pub(crate) fn wire_close_code(&self) -> u16 {
        let code = self.close_code();
        if code == CloseReason::NO_STATUS || code == CloseReason::ABNORMAL {
            CloseReason::INTERNAL
        } else {
            code
        }
    }
}

/// Parsed close frame: status code plus optional UTF-8 reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Reason string, at most 123 bytes on the wire
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data type
    pub const UNSUPPORTED: u16 = 1003;
    /// No status present (local only)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (local only)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const EXTENSION: u16 = 1010;
    /// Internal error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Whether a code may appear in a close frame on the wire.
    /// 1005 and 1006 are reserved for local synthesis.
    pub fn is_valid_wire_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 in text payload"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::PolicyViolation(msg) => write!(f, "policy violation: {}", msg),
            Error::Compression(msg) => write!(f, "compression error: {}", msg),
            Error::ConnClosed => write!(f, "connection closed"),
            Error::Closed(Some(r)) => write!(f, "closed by peer: {} ({})", r.code, r.reason),
            Error::Closed(None) => write!(f, "closed by peer"),
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            // io::Error is not Clone; preserve the kind and message
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Handshake(m) => Error::Handshake(m),
            Error::Protocol(m) => Error::Protocol(m),
            Error::InvalidUtf8 => Error::InvalidUtf8,
            Error::MessageTooLarge => Error::MessageTooLarge,
            Error::PolicyViolation(m) => Error::PolicyViolation(m),
            Error::Compression(m) => Error::Compression(m.clone()),
            Error::ConnClosed => Error::ConnClosed,
            Error::Closed(r) => Error::Closed(r.clone()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnClosed,
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(Error::Protocol("x").close_code(), 1002);
        assert_eq!(Error::InvalidUtf8.close_code(), 1007);
        assert_eq!(Error::PolicyViolation("x").close_code(), 1008);
        assert_eq!(Error::MessageTooLarge.close_code(), 1009);
        assert_eq!(Error::Compression("x".into()).close_code(), 1011);
        assert_eq!(
            Error::Closed(Some(CloseReason::new(1000, ""))).close_code(),
            1000
        );
    }

    #[test]
    fn test_wire_code_validity() {
        assert!(CloseReason::is_valid_wire_code(1000));
        assert!(CloseReason::is_valid_wire_code(1003));
        assert!(CloseReason::is_valid_wire_code(1007));
        assert!(CloseReason::is_valid_wire_code(1011));
        assert!(CloseReason::is_valid_wire_code(3000));
        assert!(CloseReason::is_valid_wire_code(4999));
        assert!(!CloseReason::is_valid_wire_code(1004));
        assert!(!CloseReason::is_valid_wire_code(1005));
        assert!(!CloseReason::is_valid_wire_code(1006));
        assert!(!CloseReason::is_valid_wire_code(1012));
        assert!(!CloseReason::is_valid_wire_code(2999));
        assert!(!CloseReason::is_valid_wire_code(5000));
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from(eof), Error::ConnClosed));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(Error::from(refused), Error::Io(_)));
    }
}
