//! Request serialization.
//!
//! A request becomes a lazy sequence of byte chunks: one chunk for the
//! request line plus headers, then the body chunks as the body produces
//! them. Headers go onto the wire in insertion order with their original
//! casing.

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http::Method;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    error::{self, Error},
    header::{HeaderMap, name},
};

/// A request body ready for the wire.
pub(crate) enum WireBody {
    Empty,
    Full(Bytes),
    Stream {
        len: u64,
        stream: stream::BoxStream<'static, Result<Bytes, Error>>,
    },
}

impl fmt::Debug for WireBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireBody::Empty => f.debug_struct("Empty").finish(),
            WireBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            WireBody::Stream { len, .. } => {
                f.debug_struct("Stream").field("len", len).finish()
            }
        }
    }
}

impl WireBody {
    fn len(&self) -> u64 {
        match self {
            WireBody::Empty => 0,
            WireBody::Full(bytes) => bytes.len() as u64,
            WireBody::Stream { len, .. } => *len,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RequestSerializer {
    head: Bytes,
    body: WireBody,
}

impl RequestSerializer {
    /// Prepare the wire form of a request.
    ///
    /// Fixed bodies get an exact `Content-Length` for write style methods
    /// (and whenever the body is non-empty). Streaming bodies must
    /// already carry one, either set by the caller or computed by a
    /// multipart form, so the transfer never needs chunked coding.
    pub(crate) fn new(
        method: &Method,
        target: &str,
        headers: &mut HeaderMap,
        body: WireBody,
    ) -> Result<RequestSerializer, Error> {
        match &body {
            WireBody::Empty | WireBody::Full(_) => {
                let is_write = matches!(*method, Method::POST | Method::PUT | Method::PATCH);
                let len = body.len();
                if is_write || len > 0 {
                    headers.insert(name::CONTENT_LENGTH, len.to_string());
                }
            }
            WireBody::Stream { .. } => {
                if !headers.contains_key(name::CONTENT_LENGTH) {
                    return Err(error::body("Content-Length not set for streaming body"));
                }
            }
        }

        let mut head = BytesMut::with_capacity(256);
        head.extend_from_slice(method.as_str().as_bytes());
        head.extend_from_slice(b" ");
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n");
        for (n, v) in headers.iter() {
            head.extend_from_slice(n.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(v.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        Ok(RequestSerializer {
            head: head.freeze(),
            body,
        })
    }

    /// The serialized request as a lazy chunk sequence.
    pub(crate) fn into_stream(self) -> stream::BoxStream<'static, Result<Bytes, Error>> {
        let head = stream::once(std::future::ready(Ok(self.head)));
        match self.body {
            WireBody::Empty => head.boxed(),
            WireBody::Full(bytes) if bytes.is_empty() => head.boxed(),
            WireBody::Full(bytes) => head
                .chain(stream::once(std::future::ready(Ok(bytes))))
                .boxed(),
            WireBody::Stream { stream: body, .. } => head.chain(body).boxed(),
        }
    }

    /// Drain every chunk onto the socket. Socket failures surface as
    /// connection errors; body producer failures keep their own kind.
    pub(crate) async fn write_to<W>(self, io: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunks = self.into_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            io.write_all(&chunk).await.map_err(error::connect)?;
        }
        io.flush().await.map_err(error::connect)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_str(serializer: RequestSerializer) -> String {
        String::from_utf8(serializer.head.to_vec()).unwrap()
    }

    #[test]
    fn request_line_and_header_order() {
        let mut headers = HeaderMap::new();
        headers.insert("Host", "example.com");
        headers.insert("X-Second", "2");
        headers.insert("x-First", "1");
        let serializer = RequestSerializer::new(
            &Method::GET,
            "/search?q=rust",
            &mut headers,
            WireBody::Empty,
        )
        .unwrap();

        assert_eq!(
            head_str(serializer),
            "GET /search?q=rust HTTP/1.1\r\n\
             Host: example.com\r\n\
             X-Second: 2\r\n\
             x-First: 1\r\n\
             \r\n"
        );
    }

    #[test]
    fn post_sets_exact_content_length() {
        let mut headers = HeaderMap::new();
        let body = Bytes::from_static(b"{\"hello\":\"world\"}");
        let expected = body.len().to_string();
        RequestSerializer::new(&Method::POST, "/post", &mut headers, WireBody::Full(body))
            .unwrap();
        assert_eq!(headers.get("content-length"), Some(expected.as_str()));
    }

    #[test]
    fn empty_post_has_zero_content_length() {
        let mut headers = HeaderMap::new();
        RequestSerializer::new(&Method::POST, "/post", &mut headers, WireBody::Empty).unwrap();
        assert_eq!(headers.get("Content-Length"), Some("0"));
    }

    #[test]
    fn get_without_body_has_no_content_length() {
        let mut headers = HeaderMap::new();
        RequestSerializer::new(&Method::GET, "/", &mut headers, WireBody::Empty).unwrap();
        assert!(!headers.contains_key("Content-Length"));
    }

    #[test]
    fn streaming_body_requires_content_length() {
        let mut headers = HeaderMap::new();
        let body = WireBody::Stream {
            len: 5,
            stream: stream::iter(vec![Ok(Bytes::from_static(b"hello"))]).boxed(),
        };
        let err = RequestSerializer::new(&Method::POST, "/", &mut headers, body).unwrap_err();
        assert!(err.is_body());
    }

    #[tokio::test]
    async fn chunks_cover_head_then_body() {
        let mut headers = HeaderMap::new();
        let serializer = RequestSerializer::new(
            &Method::POST,
            "/echo",
            &mut headers,
            WireBody::Full(Bytes::from_static(b"payload")),
        )
        .unwrap();

        let mut out = Vec::new();
        serializer.write_to(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /echo HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\npayload"));
    }
}
