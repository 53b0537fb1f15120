//! Client-side upgrade
//!
//! [`dial`] opens a TCP connection for a `ws://` URL and performs the
//! upgrade exchange; [`dial_with_stream`] runs the same exchange over a
//! caller-supplied transport (bring your own TLS).

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::conn::{Conn, Role, Transport};
use crate::deflate::{deflate_offers, DeflateConfig};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::handshake::{
    accept_key, build_request, encode_key, header_has_token, parse_response,
};
use crate::mask::generate_nonce;
use crate::Config;

/// Optional knobs for [`dial`].
#[derive(Debug, Default, Clone)]
pub struct DialOptions {
    /// Subprotocols to offer, most preferred first
    pub protocols: Vec<String>,
    /// Extra headers added to the upgrade request
    pub headers: Vec<(String, String)>,
}

/// Connect to `url` (`ws://host[:port][/path]`) and upgrade.
///
/// On success `Handler::on_open` has fired and the returned connection is
/// ready for [`Conn::read_loop`]. TLS is out of scope here; terminate it
/// yourself and use [`dial_with_stream`].
pub async fn dial(url: &str, config: Config, handler: impl Handler) -> Result<Arc<Conn>> {
    dial_with_options(url, config, handler, DialOptions::default()).await
}

/// [`dial`] with subprotocol offers and extra request headers.
pub async fn dial_with_options(
    url: &str,
    config: Config,
    handler: impl Handler,
    options: DialOptions,
) -> Result<Arc<Conn>> {
    let (host, addr, path) = parse_url(url)?;
    let stream = TcpStream::connect(&addr).await?;
    let _ = stream.set_nodelay(true);
    dial_with_stream(stream, &host, &path, config, handler, options).await
}

/// Run the client upgrade exchange over an existing transport.
pub async fn dial_with_stream<S>(
    stream: S,
    host: &str,
    path: &str,
    config: Config,
    handler: impl Handler,
    options: DialOptions,
) -> Result<Arc<Conn>>
where
    S: Transport + 'static,
{
    let config = Arc::new(config);
    let handler: Arc<dyn Handler> = Arc::new(handler);

    let deadline = config.handshake_timeout;
    match timeout(
        deadline,
        exchange(stream, host, path, config, handler, options),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Handshake("handshake timed out")),
    }
}

async fn exchange<S>(
    mut stream: S,
    host: &str,
    path: &str,
    config: Arc<Config>,
    handler: Arc<dyn Handler>,
    options: DialOptions,
) -> Result<Arc<Conn>>
where
    S: Transport + 'static,
{
    let key = encode_key(&generate_nonce());
    let offered_deflate = config.compress_enabled.then(|| config.deflate_config());
    let extensions = offered_deflate.as_ref().map(DeflateConfig::offer_value);

    let request = build_request(
        host,
        path,
        &key,
        &options.protocols,
        extensions.as_deref(),
        &options.headers,
    );
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let (response, head_len) = loop {
        if let Some(parsed) = parse_response(&buf)? {
            break parsed;
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Handshake("peer closed during handshake"));
        }
    };

    if response.status != 101 {
        debug!(status = response.status, "upgrade refused");
        return Err(Error::Handshake("expected 101 Switching Protocols"));
    }
    if !response
        .header("upgrade")
        .is_some_and(|v| header_has_token(v, "websocket"))
    {
        return Err(Error::Handshake("Upgrade header is not websocket"));
    }
    if !response
        .header("connection")
        .is_some_and(|v| header_has_token(v, "upgrade"))
    {
        return Err(Error::Handshake("Connection header lacks Upgrade token"));
    }
    if response.header("sec-websocket-accept") != Some(accept_key(&key).as_str()) {
        return Err(Error::Handshake("Sec-WebSocket-Accept mismatch"));
    }

    let deflate = match (offered_deflate, response.header("sec-websocket-extensions")) {
        (Some(base), Some(echo)) => Some(accept_deflate_echo(base, echo)?),
        // The server declined the offer; run uncompressed
        (Some(_), None) => None,
        (None, Some(_)) => {
            return Err(Error::Handshake("extension echoed without an offer"));
        }
        (None, None) => None,
    };

    let protocol = match response.header("sec-websocket-protocol") {
        Some(echo) => {
            if !options.protocols.iter().any(|p| p == echo) {
                return Err(Error::Handshake("subprotocol not offered"));
            }
            Some(echo.to_string())
        }
        None => None,
    };

    let leftover = buf.split_off(head_len.min(buf.len()));
    let conn = Conn::with_initial(
        stream,
        Role::Client,
        config,
        handler.clone(),
        deflate,
        protocol,
        leftover,
    );
    handler.on_open(&conn);
    Ok(conn)
}

/// Validate the server's extension line against our offer and fold its
/// parameters into the negotiated configuration.
fn accept_deflate_echo(mut base: DeflateConfig, echo: &str) -> Result<DeflateConfig> {
    let mut offers = deflate_offers(echo);
    if offers.len() != 1 {
        return Err(Error::Handshake("unexpected extension in response"));
    }
    let params = offers.remove(0);
    base.apply_params(&params)?;
    Ok(base)
}

fn parse_url(url: &str) -> Result<(String, String, String)> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or(Error::Handshake("URL scheme must be ws"))?;

    let (host_port, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        return Err(Error::Handshake("URL missing host"));
    }

    let addr = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{}:80", host_port)
    };

    Ok((host_port.to_string(), addr, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultHandler;
    use crate::handshake::{build_response, parse_request, validate_request};

    #[test]
    fn test_parse_url() {
        let (host, addr, path) = parse_url("ws://example.com/chat?x=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(addr, "example.com:80");
        assert_eq!(path, "/chat?x=1");

        let (host, addr, path) = parse_url("ws://127.0.0.1:9001").unwrap();
        assert_eq!(host, "127.0.0.1:9001");
        assert_eq!(addr, "127.0.0.1:9001");
        assert_eq!(path, "/");

        assert!(parse_url("wss://example.com/").is_err());
        assert!(parse_url("http://example.com/").is_err());
        assert!(parse_url("ws://").is_err());
    }

    /// Minimal scripted server: parse the request, answer with `respond`.
    async fn scripted_server(
        mut io: tokio::io::DuplexStream,
        respond: impl FnOnce(&str) -> Vec<u8> + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let key = loop {
                let n = io.read_buf(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up early");
                if let Some((req, _)) = parse_request(&buf).unwrap() {
                    break validate_request(&req).unwrap().to_string();
                }
            };
            let response = respond(&key);
            io.write_all(&response).await.unwrap();
            // Keep the transport alive so the handshake can finish
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        })
    }

    #[tokio::test]
    async fn test_dial_with_stream_success() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = scripted_server(server_io, |key| {
            build_response(&accept_key(key), None, None, &[]).to_vec()
        })
        .await;

        let conn = dial_with_stream(
            client_io,
            "localhost",
            "/",
            Config::default(),
            DefaultHandler,
            DialOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(conn.role(), Role::Client);
        assert!(conn.is_open());
        assert!(!conn.compress_negotiated());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_rejects_accept_mismatch() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = scripted_server(server_io, |_key| {
            build_response("bm90IHRoZSByaWdodCBoYXNo", None, None, &[]).to_vec()
        })
        .await;

        let err = dial_with_stream(
            client_io,
            "localhost",
            "/",
            Config::default(),
            DefaultHandler,
            DialOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Handshake("Sec-WebSocket-Accept mismatch")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_rejects_non_101() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = scripted_server(server_io, |_key| {
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n".to_vec()
        })
        .await;

        let err = dial_with_stream(
            client_io,
            "localhost",
            "/",
            Config::default(),
            DefaultHandler,
            DialOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Handshake(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_negotiates_deflate() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = scripted_server(server_io, |key| {
            build_response(
                &accept_key(key),
                None,
                Some("permessage-deflate; server_no_context_takeover"),
                &[],
            )
            .to_vec()
        })
        .await;

        let config = Config::builder().compress_enabled(true).build();
        let conn = dial_with_stream(
            client_io,
            "localhost",
            "/",
            config,
            DefaultHandler,
            DialOptions::default(),
        )
        .await
        .unwrap();

        assert!(conn.compress_negotiated());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_rejects_unoffered_extension() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = scripted_server(server_io, |key| {
            build_response(&accept_key(key), None, Some("permessage-deflate"), &[]).to_vec()
        })
        .await;

        let err = dial_with_stream(
            client_io,
            "localhost",
            "/",
            Config::default(),
            DefaultHandler,
            DialOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Handshake(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_rejects_unoffered_protocol() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = scripted_server(server_io, |key| {
            build_response(&accept_key(key), Some("chat"), None, &[]).to_vec()
        })
        .await;

        let err = dial_with_stream(
            client_io,
            "localhost",
            "/",
            Config::default(),
            DefaultHandler,
            DialOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Handshake("subprotocol not offered")));
        server.await.unwrap();
    }
}
