//! Sessions: configurable defaults, adapters mounted per URL scheme
//! prefix, and the redirect driver.

use std::{fmt, future::Future, sync::Arc, time::Instant};

use http::Method;
use tracing::debug;
use url::Url;

use crate::{
    adapter::{HttpAdapter, SendConfig},
    conn::tls::{Identity, Verify},
    error::{self, Error},
    header::{HeaderMap, name},
    redirect,
    request::{Request, RequestBuilder, Timeout},
    response::Response,
};

const DEFAULT_MAX_REDIRECTS: usize = 30;

/// Narrow cookie jar interface.
///
/// The session never interprets cookies itself: a store receives the raw
/// `Set-Cookie` values of every response and produces the `Cookie` header
/// for a URL. Redirect hops drop the previous `Cookie` header and ask the
/// store again for the new URL.
pub trait CookieStore: Send + Sync {
    /// Record the `Set-Cookie` values a response carried.
    fn set_cookies(&self, url: &Url, set_cookie_values: &mut dyn Iterator<Item = &str>);

    /// The `Cookie` header value for a request to `url`, if any.
    fn cookies(&self, url: &Url) -> Option<String>;
}

/// An asynchronous HTTP session.
///
/// Holds default send options and one transport adapter (with its own
/// connection pool) per URL scheme prefix. Cloning is cheap and clones
/// share the pools. Call [`Session::close`] when done; a session cannot
/// be used afterwards.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    adapters: Vec<(String, HttpAdapter)>,
    headers: HeaderMap,
    stream: bool,
    verify: Verify,
    identity: Option<Identity>,
    proxies: Vec<(String, Url)>,
    timeout: Option<Timeout>,
    max_redirects: usize,
    cookie_store: Option<Arc<dyn CookieStore>>,
}

/// A builder for [`Session`].
#[must_use]
pub struct SessionBuilder {
    headers: HeaderMap,
    stream: bool,
    verify: Verify,
    identity: Option<Identity>,
    proxies: Vec<(String, Url)>,
    timeout: Option<Timeout>,
    max_redirects: usize,
    cookie_store: Option<Arc<dyn CookieStore>>,
    max_per_host: usize,
    max_total: usize,
    mounts: Vec<(String, HttpAdapter)>,
    error: Option<Error>,
}

impl SessionBuilder {
    pub fn new() -> SessionBuilder {
        SessionBuilder {
            headers: HeaderMap::new(),
            stream: false,
            verify: Verify::Enabled,
            identity: None,
            proxies: Vec::new(),
            timeout: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cookie_store: None,
            max_per_host: crate::adapter::DEFAULT_MAX_PER_HOST,
            max_total: crate::adapter::DEFAULT_MAX_TOTAL,
            mounts: Vec::new(),
            error: None,
        }
    }

    /// Headers sent with every request unless the request overrides them.
    pub fn default_headers(mut self, headers: HeaderMap) -> SessionBuilder {
        self.headers = headers;
        self
    }

    /// Stream response bodies by default instead of buffering.
    pub fn stream(mut self, stream: bool) -> SessionBuilder {
        self.stream = stream;
        self
    }

    /// Certificate verification policy for https requests.
    pub fn verify(mut self, verify: Verify) -> SessionBuilder {
        self.verify = verify;
        self
    }

    /// Client certificate presented during the TLS handshake.
    pub fn identity(mut self, identity: Identity) -> SessionBuilder {
        self.identity = Some(identity);
        self
    }

    /// Register a proxy. `key` selects when it applies: a scheme
    /// (`"http"`, `"https"`), `"all"`, or a host qualified form like
    /// `"https://example.com"` or `"all://example.com"`.
    pub fn proxy(mut self, key: impl Into<String>, proxy_url: &str) -> SessionBuilder {
        match Url::parse(proxy_url) {
            Ok(url) => self.proxies.push((key.into(), url)),
            Err(e) => self.error = Some(error::builder(e)),
        }
        self
    }

    /// Default timeout applied to every request.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> SessionBuilder {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn max_redirects(mut self, max: usize) -> SessionBuilder {
        self.max_redirects = max;
        self
    }

    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> SessionBuilder {
        self.cookie_store = Some(store);
        self
    }

    /// Connection pool caps used by the default adapters.
    pub fn pool_limits(mut self, max_per_host: usize, max_total: usize) -> SessionBuilder {
        self.max_per_host = max_per_host;
        self.max_total = max_total;
        self
    }

    /// Mount an adapter for a URL prefix. The longest matching prefix
    /// wins, so a mount for `https://internal.example` beats the default
    /// `https://` mount.
    pub fn mount(mut self, prefix: impl Into<String>, adapter: HttpAdapter) -> SessionBuilder {
        self.mounts.push((prefix.into(), adapter));
        self
    }

    pub fn build(self) -> Result<Session, Error> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut adapters = self.mounts;
        adapters.push((
            "https://".to_owned(),
            HttpAdapter::with_limits(self.max_per_host, self.max_total),
        ));
        adapters.push((
            "http://".to_owned(),
            HttpAdapter::with_limits(self.max_per_host, self.max_total),
        ));
        // longest prefix first
        adapters.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        Ok(Session {
            inner: Arc::new(SessionInner {
                adapters,
                headers: self.headers,
                stream: self.stream,
                verify: self.verify,
                identity: self.identity,
                proxies: self.proxies,
                timeout: self.timeout,
                max_redirects: self.max_redirects,
                cookie_store: self.cookie_store,
            }),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}

impl Session {
    /// A session with default configuration.
    pub fn new() -> Session {
        SessionBuilder::new()
            .build()
            .expect("default session configuration is valid")
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Run `f` with a fresh session, closing it on the way out.
    pub async fn scope<F, Fut, T>(f: F) -> Result<T, Error>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let session = Session::new();
        let result = f(session.clone()).await;
        session.close().await;
        result
    }

    /// Start building a request.
    pub fn request(&self, method: Method, url: impl AsRef<str>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url.as_ref())
    }

    pub fn get(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn options(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Send a prepared request, following redirects per policy.
    pub async fn send(&self, mut request: Request) -> Result<Response, Error> {
        let stream = request.options.stream.unwrap_or(self.inner.stream);
        let allow_redirects = request.options.allow_redirects.unwrap_or(true);
        let max_redirects = request
            .options
            .max_redirects
            .unwrap_or(self.inner.max_redirects);
        let timeout = request.options.timeout.or(self.inner.timeout);
        let verify = request
            .options
            .verify
            .clone()
            .unwrap_or_else(|| self.inner.verify.clone());
        let identity = request
            .options
            .identity
            .clone()
            .or_else(|| self.inner.identity.clone());
        let proxy_override = request.options.proxy.clone();

        request.headers_mut().merge_defaults(&self.inner.headers);

        if !allow_redirects {
            return self
                .send_once(&mut request, stream, timeout, &verify, &identity, &proxy_override)
                .await;
        }

        let mut history: Vec<Response> = Vec::new();
        loop {
            let mut response = self
                .send_once(&mut request, stream, timeout, &verify, &identity, &proxy_override)
                .await?;
            response.set_history(std::mem::take(&mut history));
            if !response.is_redirect() {
                return Ok(response);
            }
            response.close().await;

            if response.history().len() + 1 > max_redirects {
                return Err(error::too_many_redirects(max_redirects, response));
            }

            let location = response
                .headers()
                .get(name::LOCATION)
                .unwrap_or_default()
                .to_owned();
            let next_url = redirect::next_url(response.url(), &location)?;
            let next_method = redirect::next_method(response.status(), request.method());
            debug!(from = %response.url(), to = %next_url, method = %next_method, "following redirect");

            let previous_host = request.url().host_str().map(str::to_owned);
            *request.method_mut() = next_method;
            *request.url_mut() = next_url;

            if !redirect::preserves_body(response.status()) {
                for header in [
                    name::CONTENT_LENGTH,
                    name::CONTENT_TYPE,
                    name::TRANSFER_ENCODING,
                ] {
                    request.headers_mut().remove(header);
                }
                *request.body_mut() = None;
            }

            // any body that survived the purge gets resent and must
            // restart from the beginning
            if let Some(body) = request.body_mut() {
                body.rewind()?;
            }

            request.headers_mut().remove(name::COOKIE);

            if request.headers().contains_key(name::AUTHORIZATION) {
                let host = request.url().host_str().map(str::to_owned);
                if host != previous_host {
                    request.headers_mut().remove(name::AUTHORIZATION);
                }
            }

            history = std::mem::take(response.history_mut());
            history.push(response);
        }
    }

    async fn send_once(
        &self,
        request: &mut Request,
        stream: bool,
        timeout: Option<Timeout>,
        verify: &Verify,
        identity: &Option<Identity>,
        proxy_override: &Option<Url>,
    ) -> Result<Response, Error> {
        let adapter = self.adapter_for(request.url())?;

        if let Some(store) = &self.inner.cookie_store {
            if !request.headers().contains_key(name::COOKIE) {
                if let Some(value) = store.cookies(request.url()) {
                    request.headers_mut().insert(name::COOKIE, value);
                }
            }
        }

        let config = SendConfig {
            stream,
            timeout,
            verify: verify.clone(),
            identity: identity.clone(),
            proxy: proxy_override
                .clone()
                .or_else(|| self.select_proxy(request.url())),
        };

        let started = Instant::now();
        let mut response = adapter.send(request, &config).await?;
        response.set_elapsed(started.elapsed());

        if let Some(store) = &self.inner.cookie_store {
            let mut values = response.headers().get_all(name::SET_COOKIE);
            store.set_cookies(request.url(), &mut values);
        }

        Ok(response)
    }

    /// The adapter mounted for the longest matching URL prefix.
    pub fn adapter_for(&self, url: &Url) -> Result<&HttpAdapter, Error> {
        let url_str = url.as_str();
        self.inner
            .adapters
            .iter()
            .find(|(prefix, _)| {
                url_str.len() >= prefix.len()
                    && url_str[..prefix.len()].eq_ignore_ascii_case(prefix)
            })
            .map(|(_, adapter)| adapter)
            .ok_or_else(|| error::builder_msg("no adapter mounted for URL"))
    }

    /// Pick a proxy for `url` from the registered table.
    fn select_proxy(&self, url: &Url) -> Option<Url> {
        let scheme = url.scheme();
        let host = url.host_str()?;
        let candidates = [
            format!("{scheme}://{host}"),
            scheme.to_owned(),
            format!("all://{host}"),
            "all".to_owned(),
        ];
        for candidate in candidates {
            if let Some((_, proxy)) = self
                .inner
                .proxies
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(&candidate))
            {
                return Some(proxy.clone());
            }
        }
        None
    }

    /// Close every adapter's pool. Idempotent; subsequent sends fail
    /// with a pool-closed error.
    pub async fn close(&self) {
        debug!("closing session");
        for (_, adapter) in &self.inner.adapters {
            adapter.close().await;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("adapters", &self.inner.adapters.len())
            .field("stream", &self.inner.stream)
            .field("max_redirects", &self.inner.max_redirects)
            .finish()
    }
}
