//! Requests and the builder used to assemble them.

use std::{fmt, time::Duration};

use http::Method;
use serde::Serialize;
use url::Url;

use crate::{
    body::Body,
    conn::tls::{Identity, Verify},
    error::{self, Error},
    header::{HeaderMap, name},
    multipart::Form,
    response::Response,
    session::Session,
};

/// Timeout configuration for one request.
///
/// A single duration bounds both the connect phase and each socket read;
/// a pair sets them separately. Connect covers establishment only, read
/// applies per socket read while parsing, not end to end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    All(Duration),
    Pair { connect: Duration, read: Duration },
}

impl Timeout {
    pub(crate) fn normalize(self) -> (Option<Duration>, Option<Duration>) {
        match self {
            Timeout::All(d) => (Some(d), Some(d)),
            Timeout::Pair { connect, read } => (Some(connect), Some(read)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Timeout {
        Timeout::All(d)
    }
}

impl From<(Duration, Duration)> for Timeout {
    fn from((connect, read): (Duration, Duration)) -> Timeout {
        Timeout::Pair { connect, read }
    }
}

/// Per-request overrides of session defaults.
#[derive(Clone, Default)]
pub(crate) struct RequestOptions {
    pub(crate) timeout: Option<Timeout>,
    pub(crate) stream: Option<bool>,
    pub(crate) allow_redirects: Option<bool>,
    pub(crate) max_redirects: Option<usize>,
    pub(crate) verify: Option<Verify>,
    pub(crate) identity: Option<Identity>,
    pub(crate) proxy: Option<Url>,
}

/// A prepared request: method, URL, headers and body, ready to send.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
    pub(crate) options: RequestOptions,
}

impl Request {
    /// Constructs a new request. Lowercase method names are normalized
    /// to uppercase.
    pub fn new(method: Method, url: Url) -> Request {
        let method = normalize_method(method);
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

fn normalize_method(method: Method) -> Method {
    let s = method.as_str();
    if s.bytes().any(|b| b.is_ascii_lowercase()) {
        Method::from_bytes(s.to_ascii_uppercase().as_bytes()).unwrap_or(method)
    } else {
        method
    }
}

/// A builder to construct the properties of a `Request`.
///
/// Obtained from the `Session` verb methods; errors accumulated while
/// building surface when `send` (or `build`) is called.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    session: Session,
    request: Result<Request, Error>,
}

impl RequestBuilder {
    pub(crate) fn new(session: Session, method: Method, url: &str) -> RequestBuilder {
        let request = Url::parse(url)
            .map(|url| Request::new(method, url))
            .map_err(error::builder);
        RequestBuilder { session, request }
    }

    fn map(mut self, f: impl FnOnce(&mut Request)) -> RequestBuilder {
        if let Ok(ref mut request) = self.request {
            f(request);
        }
        self
    }

    fn and_then(mut self, f: impl FnOnce(&mut Request) -> Result<(), Error>) -> RequestBuilder {
        if let Ok(ref mut request) = self.request {
            if let Err(e) = f(request) {
                self.request = Err(e);
            }
        }
        self
    }

    /// Add a header, replacing any existing value.
    pub fn header(self, header_name: impl Into<String>, value: impl Into<String>) -> RequestBuilder {
        self.map(|req| req.headers_mut().insert(header_name, value))
    }

    /// Append a full set of headers.
    pub fn headers(self, headers: HeaderMap) -> RequestBuilder {
        self.map(|req| {
            for (n, v) in headers.iter() {
                req.headers_mut().append(n, v);
            }
        })
    }

    /// Enable HTTP basic authentication.
    pub fn basic_auth(self, username: &str, password: Option<&str>) -> RequestBuilder {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        let credentials = STANDARD.encode(format!("{username}:{}", password.unwrap_or("")));
        self.header(name::AUTHORIZATION, format!("Basic {credentials}"))
    }

    /// Enable bearer token authentication.
    pub fn bearer_auth(self, token: impl fmt::Display) -> RequestBuilder {
        self.header(name::AUTHORIZATION, format!("Bearer {token}"))
    }

    /// Append serialized pairs to the URL query string.
    pub fn query<T: Serialize + ?Sized>(self, query: &T) -> RequestBuilder {
        self.and_then(|req| {
            let appended = serde_urlencoded::to_string(query).map_err(error::builder)?;
            if !appended.is_empty() {
                let merged = match req.url().query() {
                    Some(existing) if !existing.is_empty() => format!("{existing}&{appended}"),
                    _ => appended,
                };
                req.url_mut().set_query(Some(&merged));
            }
            Ok(())
        })
    }

    /// Timeout for this request; a `Duration` or a
    /// `(connect, read)` pair.
    pub fn timeout(self, timeout: impl Into<Timeout>) -> RequestBuilder {
        let timeout = timeout.into();
        self.map(|req| req.options.timeout = Some(timeout))
    }

    /// Hand the body back as a lazy stream instead of buffering it.
    pub fn stream(self, stream: bool) -> RequestBuilder {
        self.map(|req| req.options.stream = Some(stream))
    }

    /// Follow redirects (the default) or return them as-is.
    pub fn allow_redirects(self, allow: bool) -> RequestBuilder {
        self.map(|req| req.options.allow_redirects = Some(allow))
    }

    pub fn max_redirects(self, max: usize) -> RequestBuilder {
        self.map(|req| req.options.max_redirects = Some(max))
    }

    /// Override the session's certificate verification policy.
    pub fn verify(self, verify: Verify) -> RequestBuilder {
        self.map(|req| req.options.verify = Some(verify))
    }

    /// Override the session's client certificate.
    pub fn identity(self, identity: Identity) -> RequestBuilder {
        self.map(|req| req.options.identity = Some(identity))
    }

    /// Route this request through a proxy.
    pub fn proxy(self, proxy: &str) -> RequestBuilder {
        let parsed = Url::parse(proxy).map_err(error::builder);
        self.and_then(|req| {
            req.options.proxy = Some(parsed?);
            Ok(())
        })
    }

    /// Set the request body.
    pub fn body(self, body: impl Into<Body>) -> RequestBuilder {
        self.map(|req| *req.body_mut() = Some(body.into()))
    }

    /// Serialize `json` as the request body and set `Content-Type`.
    pub fn json<T: Serialize + ?Sized>(self, json: &T) -> RequestBuilder {
        self.and_then(|req| {
            let bytes = serde_json::to_vec(json).map_err(error::builder)?;
            req.headers_mut()
                .insert_if_absent(name::CONTENT_TYPE, "application/json");
            *req.body_mut() = Some(Body::from(bytes));
            Ok(())
        })
    }

    /// Send a form urlencoded body.
    pub fn form<T: Serialize + ?Sized>(self, form: &T) -> RequestBuilder {
        self.and_then(|req| {
            let encoded = serde_urlencoded::to_string(form).map_err(error::builder)?;
            req.headers_mut()
                .insert_if_absent(name::CONTENT_TYPE, "application/x-www-form-urlencoded");
            *req.body_mut() = Some(Body::from(encoded));
            Ok(())
        })
    }

    /// Send a multipart form body. The content type, boundary and exact
    /// content length come from the form.
    pub fn multipart(self, form: Form) -> RequestBuilder {
        self.map(|req| {
            req.headers_mut()
                .insert_if_absent(name::CONTENT_TYPE, form.content_type());
            *req.body_mut() = Some(Body::from_form(form));
        })
    }

    /// Build the request without sending it.
    pub fn build(self) -> Result<Request, Error> {
        self.request
    }

    /// Send the request, following the session's redirect policy.
    pub async fn send(self) -> Result<Response, Error> {
        let request = self.request?;
        self.session.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(Session::new(), method, url)
    }

    #[test]
    fn method_is_uppercased() {
        let method = Method::from_bytes(b"patch").unwrap();
        let req = Request::new(method, Url::parse("http://x/").unwrap());
        assert_eq!(req.method().as_str(), "PATCH");
    }

    #[test]
    fn query_appends_to_existing() {
        let req = builder(Method::GET, "http://example.com/search?q=1")
            .query(&[("page", "2"), ("lang", "en")])
            .build()
            .unwrap();
        assert_eq!(req.url().query(), Some("q=1&page=2&lang=en"));
    }

    #[test]
    fn json_sets_body_and_content_type() {
        let req = builder(Method::POST, "http://example.com/post")
            .json(&serde_json::json!({"hello": "world"}))
            .build()
            .unwrap();
        assert_eq!(req.headers().get("content-type"), Some("application/json"));
        assert_eq!(req.body().unwrap().content_length(), 17);
    }

    #[test]
    fn form_sets_content_type() {
        let req = builder(Method::POST, "http://example.com/post")
            .form(&[("a", "1")])
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get("content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn basic_auth_header() {
        let req = builder(Method::GET, "http://example.com/")
            .basic_auth("user", Some("passwd"))
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get("authorization"),
            Some("Basic dXNlcjpwYXNzd2Q=")
        );
    }

    #[test]
    fn invalid_url_errors_at_build() {
        let err = builder(Method::GET, "not a url").build().unwrap_err();
        assert!(err.is_builder());
    }
}
