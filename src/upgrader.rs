//! Server-side upgrade
//!
//! The [`Upgrader`] owns the per-endpoint policy — configuration, handler,
//! origin check, operator response headers, supported subprotocols — and
//! turns raw accepted streams into open connections.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::conn::{Conn, Role, Transport};
use crate::deflate::{deflate_offers, DeflateConfig};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::handshake::{
    accept_key, build_rejection, build_response, parse_request, validate_request, UpgradeRequest,
};
use crate::Config;

/// Origin predicate. Returning `false` rejects the upgrade with 403.
pub type CheckOrigin = dyn Fn(&UpgradeRequest) -> bool + Send + Sync;

/// Accepts HTTP/1.1 upgrade requests and produces server connections.
pub struct Upgrader {
    config: Arc<Config>,
    handler: Arc<dyn Handler>,
    check_origin: Option<Box<CheckOrigin>>,
    response_headers: Vec<(String, String)>,
    protocols: Vec<String>,
}

impl Upgrader {
    /// Create an upgrader with the given configuration and handler.
    pub fn new(config: Config, handler: impl Handler) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            check_origin: None,
            response_headers: Vec::new(),
            protocols: Vec::new(),
        }
    }

    /// Install an origin predicate. Without one, every origin is accepted.
    pub fn with_check_origin(
        mut self,
        check: impl Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_origin = Some(Box::new(check));
        self
    }

    /// Add a header to every `101` response.
    pub fn with_response_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.push((name.into(), value.into()));
        self
    }

    /// Declare the subprotocols this endpoint speaks. The first client
    /// offer found in this list is selected and echoed.
    pub fn with_protocols(mut self, protocols: &[&str]) -> Self {
        self.protocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Perform the server side of the upgrade exchange on `stream`.
    ///
    /// On success the stream is owned by the returned connection and
    /// `Handler::on_open` has fired; drive it with [`Conn::read_loop`].
    /// Validation failures answer `400`, a rejected origin answers `403`,
    /// and the error names what went wrong. The whole exchange is bounded
    /// by `Config::handshake_timeout`.
    pub async fn accept<S>(&self, stream: S) -> Result<Arc<Conn>>
    where
        S: Transport + 'static,
    {
        match timeout(self.config.handshake_timeout, self.exchange(stream)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Handshake("handshake timed out")),
        }
    }

    async fn exchange<S>(&self, mut stream: S) -> Result<Arc<Conn>>
    where
        S: Transport + 'static,
    {
        let mut buf = BytesMut::with_capacity(1024);
        let (request, head_len) = loop {
            match parse_request(&buf) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {}
                Err(err) => {
                    let _ = stream.write_all(&build_rejection(400, "Bad Request")).await;
                    return Err(err);
                }
            }
            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(Error::Handshake("peer closed during handshake"));
            }
        };

        let key = match validate_request(&request) {
            Ok(key) => key,
            Err(err) => {
                debug!(path = %request.path, error = %err, "rejecting upgrade");
                let _ = stream.write_all(&build_rejection(400, "Bad Request")).await;
                return Err(err);
            }
        };

        if let Some(check) = &self.check_origin {
            if !check(&request) {
                let _ = stream.write_all(&build_rejection(403, "Forbidden")).await;
                return Err(Error::Handshake("origin rejected"));
            }
        }

        let deflate = self.negotiate_deflate(&request);
        let protocol = self.select_protocol(&request);

        let accept = accept_key(key);
        let extension_value = deflate.as_ref().map(DeflateConfig::response_value);
        let response = build_response(
            &accept,
            protocol.as_deref(),
            extension_value.as_deref(),
            &self.response_headers,
        );
        stream.write_all(&response).await?;
        stream.flush().await?;

        // Frames pipelined behind the request head belong to the connection
        let leftover = buf.split_off(head_len.min(buf.len()));

        let conn = Conn::with_initial(
            stream,
            Role::Server,
            self.config.clone(),
            self.handler.clone(),
            deflate,
            protocol,
            leftover,
        );
        self.handler.on_open(&conn);
        Ok(conn)
    }

    /// Pick the first acceptable `permessage-deflate` offer, if any.
    fn negotiate_deflate(&self, request: &UpgradeRequest) -> Option<DeflateConfig> {
        if !self.config.compress_enabled {
            return None;
        }
        let header = request.header("sec-websocket-extensions")?;

        for offer in deflate_offers(header) {
            let mut negotiated = self.config.deflate_config();
            if negotiated.apply_params(&offer).is_ok() {
                return Some(negotiated);
            }
        }
        None
    }

    fn select_protocol(&self, request: &UpgradeRequest) -> Option<String> {
        request
            .protocols()
            .into_iter()
            .find(|offer| self.protocols.iter().any(|p| p == offer))
            .map(str::to_string)
    }
}
