//! Per-request orchestration.
//!
//! One `send` binds a prepared request to a pooled connection, drains the
//! serialized request onto the socket, parses the response, and either
//! buffers the body eagerly (disposing of the connection right away) or
//! hands back a streaming response whose consumption does the disposal.
//! Any failure between checkout and disposal closes the connection.

use http::Method;
use tracing::debug;
use url::{Position, Url};

use crate::{
    conn::{
        ConnectOptions, Connection, ConnectionPool, PoolKey, Scheme,
        tls::{self, Identity, Verify},
    },
    error::Error,
    header::{HeaderMap, name},
    proto::{
        decode::Decoder,
        parse::{BodyReader, ResponseHead, ResponseParser},
        serialize::{RequestSerializer, WireBody},
    },
    request::{Request, Timeout},
    response::{Response, drain_body},
};

pub(crate) const DEFAULT_MAX_PER_HOST: usize = 10;
pub(crate) const DEFAULT_MAX_TOTAL: usize = 100;

/// Resolved send parameters for one request, defaults already merged.
#[derive(Clone)]
pub(crate) struct SendConfig {
    pub(crate) stream: bool,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) verify: Verify,
    pub(crate) identity: Option<Identity>,
    pub(crate) proxy: Option<Url>,
}

/// An HTTP transport adapter with its own connection pool.
#[derive(Clone, Debug)]
pub struct HttpAdapter {
    pool: ConnectionPool,
}

impl HttpAdapter {
    pub fn new() -> HttpAdapter {
        HttpAdapter::with_limits(DEFAULT_MAX_PER_HOST, DEFAULT_MAX_TOTAL)
    }

    pub fn with_limits(max_per_host: usize, max_total: usize) -> HttpAdapter {
        HttpAdapter {
            pool: ConnectionPool::new(max_per_host, max_total),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Close the pool; in-flight connections die when they come back.
    pub async fn close(&self) {
        self.pool.close(false);
    }

    pub(crate) async fn send(
        &self,
        request: &mut Request,
        config: &SendConfig,
    ) -> Result<Response, Error> {
        let url = request.url().clone();
        let key = PoolKey::from_url(&url)?;
        let is_head = *request.method() == Method::HEAD;

        let tls_config = match key.scheme {
            Scheme::Https => Some(tls::client_config(&config.verify, config.identity.as_ref())?),
            Scheme::Http => None,
        };
        let (connect_timeout, read_timeout) = config
            .timeout
            .map(Timeout::normalize)
            .unwrap_or((None, None));

        let mut headers = request.headers().clone();
        headers.insert_if_absent(name::HOST, host_header(&url));

        let wire_body = match request.body_mut() {
            Some(body) => body.wire().map_err(|e| e.with_url(url.clone()))?,
            None => WireBody::Empty,
        };
        if let WireBody::Stream { len, .. } = &wire_body {
            // length-known streams must announce their size up front
            headers.insert_if_absent(name::CONTENT_LENGTH, len.to_string());
        }

        let connect = ConnectOptions {
            connect_timeout,
            tls: tls_config,
            proxy: config.proxy.clone(),
        };
        let mut conn = self
            .pool
            .get(key, &connect)
            .await
            .map_err(|e| e.with_url(url.clone()))?;

        let target = request_target(&url, conn.is_proxied());
        debug!(method = %request.method(), %target, reused = conn.is_reused(), "sending request");

        let exchange = self
            .exchange(&mut conn, request.method(), &target, headers, wire_body, read_timeout, is_head)
            .await;
        let (head, reader) = match exchange {
            Ok(parts) => parts,
            Err(e) => {
                conn.close();
                return Err(e.with_url(url));
            }
        };

        let decoder = Decoder::from_headers(&head.headers);
        if config.stream {
            return Ok(Response::streaming(head, url, conn, reader, decoder));
        }
        self.buffer_eagerly(head, url, conn, reader, decoder).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        conn: &mut Connection,
        method: &Method,
        target: &str,
        mut headers: HeaderMap,
        body: WireBody,
        read_timeout: Option<std::time::Duration>,
        is_head: bool,
    ) -> Result<(ResponseHead, BodyReader), Error> {
        let serializer = RequestSerializer::new(method, target, &mut headers, body)?;
        let transport = conn.transport_mut();
        serializer.write_to(&mut transport.io).await?;
        ResponseParser::new(read_timeout)
            .head_response(is_head)
            .parse(&mut transport.io)
            .await
    }

    async fn buffer_eagerly(
        &self,
        head: ResponseHead,
        url: Url,
        mut conn: Connection,
        mut reader: BodyReader,
        mut decoder: Option<Decoder>,
    ) -> Result<Response, Error> {
        let keep_alive = head.keep_alive;
        match drain_body(&mut conn, &mut reader, decoder.as_mut()).await {
            Ok(content) => {
                if keep_alive {
                    conn.release();
                } else {
                    conn.close();
                }
                Ok(Response::buffered(head, url, content))
            }
            Err(e) => {
                conn.close();
                Err(e.with_url(url))
            }
        }
    }
}

impl Default for HttpAdapter {
    fn default() -> Self {
        HttpAdapter::new()
    }
}

/// `Host` header for a URL: no port when it is the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// Origin-form path and query; absolute-form when the request travels to
/// a proxy in the clear.
fn request_target(url: &Url, proxied: bool) -> String {
    if proxied {
        return url[..Position::AfterQuery].to_owned();
    }
    let target = &url[Position::BeforePath..Position::AfterQuery];
    if target.is_empty() {
        "/".to_owned()
    } else {
        target.to_owned()
    }
}
