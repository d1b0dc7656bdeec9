//! The connection pool.
//!
//! Wraps the generic resource pool with socket lifecycle: opening TCP
//! (optionally through an HTTP proxy), TLS, the peer-closed probe for
//! reused connections, and release/close disposal.

pub(crate) mod tls;

use std::{fmt, io, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::Method;
use rustls::ClientConfig;
use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, trace};
use url::Url;

use self::tls::MaybeTlsStream;
use crate::{
    error::{self, Error},
    header::{HeaderMap, name},
    pool::{Acquire, Pool, PutOutcome, Ready, Resource},
    proto::{
        parse::ResponseParser,
        serialize::{RequestSerializer, WireBody},
    },
};

/// URL scheme of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn from_str(scheme: &str) -> Result<Scheme, Error> {
        match scheme {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(error::builder_msg("unsupported URL scheme")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The `(scheme, host, port)` triple connections are bucketed by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> PoolKey {
        PoolKey {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub(crate) fn from_url(url: &Url) -> Result<PoolKey, Error> {
        let scheme = Scheme::from_str(url.scheme())?;
        let host = url
            .host_str()
            .ok_or_else(|| error::builder_msg("URL has no host"))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(scheme.default_port());
        Ok(PoolKey { scheme, host, port })
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// A live socket plus the metadata the request layer needs.
pub(crate) struct Transport {
    pub(crate) io: MaybeTlsStream,
    /// Plain http through a forward proxy; requests use absolute-form.
    pub(crate) proxied: bool,
}

enum Probe {
    Alive,
    PeerClosed,
    Unexpected,
}

/// One non-blocking single-byte read against the TCP stream. For TLS
/// connections the probe runs below the TLS layer; any readable bytes on
/// an idle connection mean it cannot be reused either way.
fn probe(io: &MaybeTlsStream) -> Probe {
    let mut byte = [0u8; 1];
    match io.tcp_ref().try_read(&mut byte) {
        Ok(0) => Probe::PeerClosed,
        Ok(_) => Probe::Unexpected,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Probe::Alive,
        Err(_) => Probe::PeerClosed,
    }
}

/// Options for opening a connection.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Deadline for the whole establishment phase: TCP, tunnel, TLS.
    pub connect_timeout: Option<Duration>,
    /// TLS configuration; required for https keys.
    pub tls: Option<Arc<ClientConfig>>,
    /// Forward proxy to connect through.
    pub proxy: Option<Url>,
}

/// A pool of keep-alive HTTP connections with per-host and global caps.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolHandle>,
}

struct PoolHandle {
    pool: Pool<PoolKey, Transport>,
}

impl ConnectionPool {
    pub fn new(max_per_host: usize, max_total: usize) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolHandle {
                pool: Pool::new(max_per_host, max_total),
            }),
        }
    }

    pub fn num_idle(&self) -> usize {
        self.inner.pool.num_idle()
    }

    pub fn num_busy(&self) -> usize {
        self.inner.pool.num_busy()
    }

    pub fn num_total(&self) -> usize {
        self.inner.pool.num_total()
    }

    pub fn size(&self, key: &PoolKey) -> usize {
        self.inner.pool.size(key)
    }

    /// Acquire a connection for `key`, reusing an idle one when the peer
    /// still holds its half open.
    pub async fn get(&self, key: PoolKey, opts: &ConnectOptions) -> Result<Connection, Error> {
        loop {
            let acquired = self
                .inner
                .pool
                .get(&key)
                .map_err(|_| error::pool_closed())?;
            match acquired {
                Acquire::Idle(resource) => {
                    if let Some(conn) = self.try_reuse(resource) {
                        return Ok(conn);
                    }
                    // peer hung up on the idle connection, acquire again
                }
                Acquire::Open { open, evict } => {
                    if let Some(mut evicted) = evict {
                        trace!(key = %evicted.key(), "evicting idle connection");
                        drop(evicted.take_value());
                    }
                    return self.open(open, &key, opts).await;
                }
                Acquire::Wait(waiter) => {
                    debug!(key = %key, "pool saturated, waiting");
                    match waiter.recv().await {
                        Ok(Ready::Idle(resource)) => {
                            if let Some(conn) = self.try_reuse(resource) {
                                return Ok(conn);
                            }
                        }
                        Ok(Ready::Open(open)) => return self.open(open, &key, opts).await,
                        Err(_) => return Err(error::pool_closed()),
                    }
                }
            }
        }
    }

    fn try_reuse(&self, resource: Resource<PoolKey, Transport>) -> Option<Connection> {
        let alive = match resource.value() {
            Some(transport) => match probe(&transport.io) {
                Probe::Alive => true,
                Probe::PeerClosed => {
                    trace!(key = %resource.key(), "idle connection closed by peer");
                    false
                }
                Probe::Unexpected => {
                    debug_assert!(false, "idle connection has unread bytes");
                    false
                }
            },
            None => false,
        };
        if alive {
            trace!(key = %resource.key(), "reusing idle connection");
            Some(Connection::new(self.clone(), resource, true))
        } else {
            self.complete_put(self.inner.pool.put(resource, true));
            None
        }
    }

    async fn open(
        &self,
        mut open: Resource<PoolKey, Transport>,
        key: &PoolKey,
        opts: &ConnectOptions,
    ) -> Result<Connection, Error> {
        let connecting = self.open_transport(key, opts);
        let result = match opts.connect_timeout {
            Some(deadline) => match timeout(deadline, connecting).await {
                Ok(result) => result,
                Err(_) => Err(error::connect_timeout()),
            },
            None => connecting.await,
        };
        match result {
            Ok(transport) => {
                debug!(key = %key, "opened new connection");
                open.set_value(transport);
                Ok(Connection::new(self.clone(), open, false))
            }
            Err(e) => {
                // hand the reservation back so a waiter can take over
                self.complete_put(self.inner.pool.put(open, true));
                Err(e)
            }
        }
    }

    async fn open_transport(
        &self,
        key: &PoolKey,
        opts: &ConnectOptions,
    ) -> Result<Transport, Error> {
        let (connect_host, connect_port) = match &opts.proxy {
            Some(proxy) => {
                let host = proxy
                    .host_str()
                    .ok_or_else(|| error::builder_msg("proxy URL has no host"))?
                    .to_owned();
                let port = proxy.port_or_known_default().unwrap_or(80);
                (host, port)
            }
            None => (key.host.clone(), key.port),
        };

        let tcp = TcpStream::connect((bare_host(&connect_host), connect_port))
            .await
            .map_err(error::connect)?;
        tcp.set_nodelay(true).ok();

        match key.scheme {
            Scheme::Http => Ok(Transport {
                io: MaybeTlsStream::Plain(tcp),
                proxied: opts.proxy.is_some(),
            }),
            Scheme::Https => {
                let config = opts
                    .tls
                    .clone()
                    .ok_or_else(|| error::builder_msg("https connection without TLS config"))?;
                let tcp = match &opts.proxy {
                    Some(proxy) => self.tunnel(tcp, key, proxy).await?,
                    None => tcp,
                };
                let stream = tls::handshake(config, bare_host(&key.host), tcp).await?;
                Ok(Transport {
                    io: MaybeTlsStream::Tls(Box::new(stream)),
                    proxied: false,
                })
            }
        }
    }

    /// Establish a CONNECT tunnel through `proxy` for the target key.
    async fn tunnel(
        &self,
        mut tcp: TcpStream,
        key: &PoolKey,
        proxy: &Url,
    ) -> Result<TcpStream, Error> {
        let authority = format!("{}:{}", key.host, key.port);
        debug!(target = %authority, "establishing CONNECT tunnel");

        let mut headers = HeaderMap::new();
        headers.insert(name::HOST, authority.clone());
        if !proxy.username().is_empty() {
            let user = percent_encoding::percent_decode_str(proxy.username()).decode_utf8_lossy();
            let password = proxy
                .password()
                .map(|p| percent_encoding::percent_decode_str(p).decode_utf8_lossy())
                .unwrap_or_default();
            let credentials = BASE64.encode(format!("{user}:{password}"));
            headers.insert(name::PROXY_AUTHORIZATION, format!("Basic {credentials}"));
        }

        RequestSerializer::new(&Method::CONNECT, &authority, &mut headers, WireBody::Empty)?
            .write_to(&mut tcp)
            .await?;

        let (head, reader) = ResponseParser::new(None)
            .head_response(true)
            .parse(&mut tcp)
            .await?;
        if !head.status.is_success() {
            return Err(error::proxy(head.status.as_u16()));
        }
        debug_assert_eq!(reader.buffered_len(), 0, "bytes after CONNECT response");
        Ok(tcp)
    }

    /// Execute the intents of a pool `put`: drop sockets slated for
    /// closing and deliver the waiter notification. A notification whose
    /// waiter vanished re-books the resource and tries the next one.
    pub(crate) fn complete_put(&self, mut outcome: PutOutcome<PoolKey, Transport>) {
        loop {
            if let Some(mut resource) = outcome.close.take() {
                trace!(key = %resource.key(), "closing connection");
                drop(resource.take_value());
            }
            match outcome.notify.take() {
                None => return,
                Some((tx, ready)) => match tx.send(ready) {
                    Ok(()) => return,
                    Err(ready) => {
                        trace!("pool waiter canceled before handoff");
                        outcome = match ready {
                            Ready::Idle(resource) => self.inner.pool.put(resource, false),
                            Ready::Open(resource) => self.inner.pool.put(resource, true),
                        };
                    }
                },
            }
        }
    }

    /// Close the pool. Idle connections drop now, busy ones when their
    /// holders dispose of them; with `force` their bookkeeping is
    /// discarded immediately. Waiters fail with a pool-closed error.
    pub fn close(&self, force: bool) {
        let (to_close, waiters) = self.inner.pool.close(force);
        for mut resource in to_close {
            drop(resource.take_value());
        }
        drop(waiters);
        debug!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.num_idle())
            .field("total", &self.num_total())
            .finish()
    }
}

/// IPv6 hosts come out of URLs in bracketed form; sockets and SNI want
/// them bare.
fn bare_host(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// An exclusively held pooled connection.
///
/// Exactly one of busy, released or closed at any time. After `release`
/// or `close` the socket must not be touched again through this handle;
/// both are idempotent and dropping an undisposed connection closes it.
pub struct Connection {
    pool: ConnectionPool,
    key: PoolKey,
    resource: Option<Resource<PoolKey, Transport>>,
    reused: bool,
    closed: bool,
    released: bool,
}

impl Connection {
    fn new(pool: ConnectionPool, resource: Resource<PoolKey, Transport>, reused: bool) -> Connection {
        Connection {
            pool,
            key: resource.key().clone(),
            resource: Some(resource),
            reused,
            closed: false,
            released: false,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Whether this connection came from the idle set.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn transport_mut(&mut self) -> &mut Transport {
        self.resource
            .as_mut()
            .and_then(Resource::value_mut)
            .expect("connection already disposed")
    }

    pub(crate) fn is_proxied(&self) -> bool {
        self.resource
            .as_ref()
            .and_then(Resource::value)
            .is_some_and(|t| t.proxied)
    }

    /// Return the connection to the idle set for reuse.
    pub fn release(&mut self) {
        self.dispose(false);
    }

    /// Destroy the connection.
    pub fn close(&mut self) {
        self.dispose(true);
    }

    fn dispose(&mut self, close: bool) {
        if self.closed || self.released {
            return;
        }
        if close {
            self.closed = true;
        } else {
            self.released = true;
        }
        if let Some(resource) = self.resource.take() {
            let outcome = self.pool.inner.pool.put(resource, close);
            self.pool.complete_put(outcome);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed && !self.released {
            trace!(key = %self.key, "dropping undisposed connection");
            self.dispose(true);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("reused", &self.reused)
            .field("closed", &self.closed)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_from_url() {
        let url = Url::parse("http://example.com/path").unwrap();
        let key = PoolKey::from_url(&url).unwrap();
        assert_eq!(key.scheme, Scheme::Http);
        assert_eq!(key.host, "example.com");
        assert_eq!(key.port, 80);

        let url = Url::parse("https://example.com:8443/").unwrap();
        let key = PoolKey::from_url(&url).unwrap();
        assert_eq!(key.scheme, Scheme::Https);
        assert_eq!(key.port, 8443);

        let url = Url::parse("ftp://example.com/").unwrap();
        assert!(PoolKey::from_url(&url).unwrap_err().is_builder());
    }

    #[test]
    fn bracketed_hosts_are_stripped() {
        assert_eq!(bare_host("[::1]"), "::1");
        assert_eq!(bare_host("example.com"), "example.com");
    }

    #[test]
    fn pool_key_display() {
        let key = PoolKey::new(Scheme::Https, "example.com", 443);
        assert_eq!(key.to_string(), "https://example.com:443");
    }
}
