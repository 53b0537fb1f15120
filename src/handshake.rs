//! HTTP/1.1 upgrade exchange (RFC 6455 §4)
//!
//! Wire-level parsing and serialization only; the negotiation policy lives
//! in [`crate::upgrader`] and [`crate::client`].

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Upper bound on the HTTP head of either direction
pub const MAX_HEADER_BLOCK: usize = 8192;

/// A parsed upgrade request
#[derive(Debug)]
pub struct UpgradeRequest {
    /// Request path, query string included
    pub path: String,
    /// All request headers, in order, names lowercased
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// First value of a header, by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The Origin header, when present.
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    /// Comma-separated subprotocol offers, split and trimmed.
    pub fn protocols(&self) -> Vec<&str> {
        self.header("sec-websocket-protocol")
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Parse an upgrade request head. Returns the request and the bytes it
/// consumed, or `None` while the head is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    if buf.len() > MAX_HEADER_BLOCK {
        return Err(Error::Handshake("request head too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 48];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if req.method != Some("GET") {
                return Err(Error::Handshake("method must be GET"));
            }

            let mut parsed = Vec::with_capacity(req.headers.len());
            for header in req.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::Handshake("non-UTF-8 header value"))?;
                parsed.push((header.name.to_ascii_lowercase(), value.to_string()));
            }

            Ok(Some((
                UpgradeRequest {
                    path: req.path.unwrap_or("/").to_string(),
                    headers: parsed,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::Handshake("malformed HTTP request")),
    }
}

/// Validate the mandatory upgrade headers of a parsed request and return
/// its `Sec-WebSocket-Key`. Each failure names the offending header.
pub fn validate_request(req: &UpgradeRequest) -> Result<&str> {
    if !req
        .header("connection")
        .is_some_and(|v| header_has_token(v, "upgrade"))
    {
        return Err(Error::Handshake("Connection header lacks Upgrade token"));
    }
    if !req
        .header("upgrade")
        .is_some_and(|v| header_has_token(v, "websocket"))
    {
        return Err(Error::Handshake("Upgrade header is not websocket"));
    }
    if req.header("sec-websocket-version") != Some("13") {
        return Err(Error::Handshake("Sec-WebSocket-Version must be 13"));
    }

    let key = req
        .header("sec-websocket-key")
        .ok_or(Error::Handshake("missing Sec-WebSocket-Key"))?;
    if key.len() != 24
        || base64::engine::general_purpose::STANDARD
            .decode(key)
            .map(|k| k.len())
            != Ok(16)
    {
        return Err(Error::Handshake("malformed Sec-WebSocket-Key"));
    }
    Ok(key)
}

/// Case-insensitive token search within a comma-separated header value.
pub fn header_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Derive `Sec-WebSocket-Accept` from the client key:
/// `base64(SHA1(key || GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Encode the 16-byte client nonce as the `Sec-WebSocket-Key` value.
pub fn encode_key(nonce: &[u8; 16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Serialize the `101 Switching Protocols` response.
pub fn build_response(
    accept: &str,
    protocol: Option<&str>,
    extensions: Option<&str>,
    extra: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }
    for (name, value) in extra {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Serialize an HTTP error response used to refuse an upgrade.
pub fn build_rejection(status: u16, reason: &str) -> Bytes {
    let body = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    Bytes::from(body)
}

/// Serialize the client's upgrade request.
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    protocols: &[String],
    extensions: Option<&str>,
    extra: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if !protocols.is_empty() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocols.join(", ").as_bytes());
        buf.put_slice(b"\r\n");
    }
    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }
    for (name, value) in extra {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// A parsed upgrade response (client side)
#[derive(Debug)]
pub struct UpgradeResponse {
    /// HTTP status code
    pub status: u16,
    /// All response headers, names lowercased
    pub headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    /// First value of a header, by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse an upgrade response head. Returns the response and the bytes it
/// consumed, or `None` while the head is still incomplete.
pub fn parse_response(buf: &[u8]) -> Result<Option<(UpgradeResponse, usize)>> {
    if buf.len() > MAX_HEADER_BLOCK {
        return Err(Error::Handshake("response head too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 48];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let mut parsed = Vec::with_capacity(res.headers.len());
            for header in res.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::Handshake("non-UTF-8 header value"))?;
                parsed.push((header.name.to_ascii_lowercase(), value.to_string()));
            }

            Ok(Some((
                UpgradeResponse {
                    status: res.code.unwrap_or(0),
                    headers: parsed,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::Handshake("malformed HTTP response")),
    }
}
