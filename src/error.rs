use std::{error::Error as StdError, fmt};

use url::Url;

use crate::response::Response;

/// A `Result` alias where the `Err` case is `weir::Error`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur when processing a request.
///
/// Inspect the error with the `is_*` methods to find out what went wrong:
/// where the failure happened (connect, read, decode) rather than every
/// detail of the underlying cause.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
    response: Option<Box<Response>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Builder,
    Connect,
    ConnectTimeout,
    ReadTimeout,
    Proxy,
    Protocol,
    Decode,
    ChunkedCoding,
    ContentDecoding,
    StreamConsumed,
    UnrewindableBody,
    TooManyRedirects,
    PoolClosed,
    State,
    Body,
}

impl Error {
    pub(crate) fn new(kind: Kind, source: Option<BoxError>) -> Error {
        Error {
            inner: Box::new(Inner {
                kind,
                source,
                url: None,
                response: None,
            }),
        }
    }

    /// Returns the URL associated with this error, if any.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Attach a URL to the error.
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// The response that triggered this error, when one exists.
    ///
    /// Only populated for redirect-policy errors, where the offending
    /// response (with its accumulated history) is kept for inspection.
    pub fn response(&self) -> Option<&Response> {
        self.inner.response.as_deref()
    }

    /// Consume the error, returning the attached response if there is one.
    pub fn into_response(self) -> Option<Response> {
        self.inner.response.map(|r| *r)
    }

    /// Returns true if the error came from a builder (bad URL, bad TLS
    /// configuration, malformed request parts).
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true for transport failures: DNS, refused, reset, I/O.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if establishing the connection exceeded the deadline.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectTimeout)
    }

    /// Returns true if a socket read exceeded the read timeout.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ReadTimeout)
    }

    /// Returns true for either timeout flavor.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectTimeout | Kind::ReadTimeout)
    }

    /// Returns true if a proxy refused or failed the CONNECT tunnel.
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy)
    }

    /// Returns true for malformed or truncated HTTP in the response.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true for gzip/deflate decoder failures.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true for protocol errors surfaced through a body stream.
    pub fn is_chunked_coding(&self) -> bool {
        matches!(self.inner.kind, Kind::ChunkedCoding)
    }

    /// Returns true for decoder errors surfaced through a body stream.
    pub fn is_content_decoding(&self) -> bool {
        matches!(self.inner.kind, Kind::ContentDecoding)
    }

    /// Returns true if a body stream was consumed a second time.
    pub fn is_stream_consumed(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamConsumed)
    }

    /// Returns true if a redirect required replaying a body that cannot
    /// be rewound.
    pub fn is_unrewindable_body(&self) -> bool {
        matches!(self.inner.kind, Kind::UnrewindableBody)
    }

    /// Returns true if the redirect limit was exceeded.
    pub fn is_too_many_redirects(&self) -> bool {
        matches!(self.inner.kind, Kind::TooManyRedirects)
    }

    /// Returns true if the connection pool was closed.
    pub fn is_pool_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolClosed)
    }

    /// Returns true for state misuse, like reading unbuffered content.
    pub fn is_state(&self) -> bool {
        matches!(self.inner.kind, Kind::State)
    }

    /// Returns true for request body errors.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Re-wrap for delivery through a body stream: protocol failures
    /// become chunked-coding errors, decoder failures become
    /// content-decoding errors, and read timeouts surface as connection
    /// errors, matching what a consumer of the lazy body observes.
    pub(crate) fn into_stream_error(self) -> Error {
        let kind = match self.inner.kind {
            Kind::Protocol => Kind::ChunkedCoding,
            Kind::Decode => Kind::ContentDecoding,
            Kind::ReadTimeout => Kind::Connect,
            other => other,
        };
        Error::new(kind, Some(Box::new(self)))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("weir::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.inner.kind {
            Kind::Builder => "builder error",
            Kind::Connect => "connection error",
            Kind::ConnectTimeout => "timed out connecting",
            Kind::ReadTimeout => "timed out reading from the connection",
            Kind::Proxy => "proxy refused the tunnel",
            Kind::Protocol => "invalid HTTP response",
            Kind::Decode => "error decoding response body",
            Kind::ChunkedCoding => "connection broken while streaming body",
            Kind::ContentDecoding => "error decoding streamed body",
            Kind::StreamConsumed => "response body already consumed",
            Kind::UnrewindableBody => "cannot rewind request body for redirect",
            Kind::TooManyRedirects => "exceeded the maximum number of redirects",
            Kind::PoolClosed => "connection pool closed",
            Kind::State => "invalid response state",
            Kind::Body => "request body error",
        };
        f.write_str(msg)?;
        if let Some(ref url) = self.inner.url {
            write!(f, " for url ({url})")?;
        }
        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

// constructors used across the crate

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder, Some(e.into()))
}

pub(crate) fn builder_msg(msg: &'static str) -> Error {
    Error::new(Kind::Builder, Some(msg.into()))
}

pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Connect, Some(e.into()))
}

pub(crate) fn connect_timeout() -> Error {
    Error::new(Kind::ConnectTimeout, None)
}

pub(crate) fn read_timeout() -> Error {
    Error::new(Kind::ReadTimeout, None)
}

pub(crate) fn proxy(status: u16) -> Error {
    Error::new(
        Kind::Proxy,
        Some(format!("proxy CONNECT responded with status {status}").into()),
    )
}

pub(crate) fn protocol(msg: &'static str) -> Error {
    Error::new(Kind::Protocol, Some(msg.into()))
}

pub(crate) fn protocol_source<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Protocol, Some(e.into()))
}

pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Decode, Some(e.into()))
}

pub(crate) fn stream_consumed() -> Error {
    Error::new(Kind::StreamConsumed, None)
}

pub(crate) fn unrewindable_body() -> Error {
    Error::new(Kind::UnrewindableBody, None)
}

pub(crate) fn too_many_redirects(max: usize, response: Response) -> Error {
    let mut err = Error::new(
        Kind::TooManyRedirects,
        Some(format!("exceeded {max} redirects").into()),
    );
    err.inner.url = Some(response.url().clone());
    err.inner.response = Some(Box::new(response));
    err
}

pub(crate) fn pool_closed() -> Error {
    Error::new(Kind::PoolClosed, None)
}

pub(crate) fn state(msg: &'static str) -> Error {
    Error::new(Kind::State, Some(msg.into()))
}

pub(crate) fn body(msg: &'static str) -> Error {
    Error::new(Kind::Body, Some(msg.into()))
}

pub(crate) fn body_source<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Body, Some(e.into()))
}
