//! Request bodies.
//!
//! A body is one of: fixed bytes, a file on disk, a caller supplied
//! stream with a known length, or a multipart form. Bytes, files and
//! multipart forms can be serialized again after a redirect; a one-shot
//! stream cannot.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream::BoxStream};
use tokio_util::io::ReaderStream;

use crate::{
    error::{self, Error},
    multipart::Form,
    proto::serialize::WireBody,
};

const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// A request body.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Bytes(Bytes),
    File {
        path: PathBuf,
        len: u64,
    },
    Stream {
        len: u64,
        stream: Option<BoxStream<'static, Result<Bytes, Error>>>,
    },
    Multipart(Form),
}

impl Body {
    pub fn empty() -> Body {
        Body {
            inner: Inner::Bytes(Bytes::new()),
        }
    }

    /// A body streamed from a file, sized now and opened at send time.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Body, Error> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path)
            .await
            .map_err(error::body_source)?
            .len();
        Ok(Body {
            inner: Inner::File { path, len },
        })
    }

    /// A body from an arbitrary chunk stream of known total length.
    ///
    /// The stream can be played once; a redirect that needs to resend
    /// the body fails with an unrewindable body error.
    pub fn sized_stream<S, B, E>(len: u64, stream: S) -> Body
    where
        S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
        B: Into<Bytes> + 'static,
        E: Into<crate::error::BoxError> + 'static,
    {
        let stream = stream
            .map_ok(Into::into)
            .map_err(error::body_source)
            .boxed();
        Body {
            inner: Inner::Stream {
                len,
                stream: Some(stream),
            },
        }
    }

    pub(crate) fn from_form(form: Form) -> Body {
        Body {
            inner: Inner::Multipart(form),
        }
    }

    pub(crate) fn as_form(&self) -> Option<&Form> {
        match &self.inner {
            Inner::Multipart(form) => Some(form),
            _ => None,
        }
    }

    /// Total number of bytes the body will produce.
    pub fn content_length(&self) -> u64 {
        match &self.inner {
            Inner::Bytes(bytes) => bytes.len() as u64,
            Inner::File { len, .. } => *len,
            Inner::Stream { len, .. } => *len,
            Inner::Multipart(form) => form.content_length(),
        }
    }

    /// Whether the body can be serialized again from the start.
    pub fn rewindable(&self) -> bool {
        match &self.inner {
            Inner::Bytes(_) | Inner::File { .. } | Inner::Multipart(_) => true,
            Inner::Stream { .. } => false,
        }
    }

    /// Reset the body for another transmission.
    ///
    /// Bytes, file and multipart bodies regenerate their chunk sequence
    /// from scratch, so this only fails for one-shot streams.
    pub(crate) fn rewind(&mut self) -> Result<(), Error> {
        if self.rewindable() {
            Ok(())
        } else {
            Err(error::unrewindable_body())
        }
    }

    /// The body in wire form for one transmission.
    pub(crate) fn wire(&mut self) -> Result<WireBody, Error> {
        match &mut self.inner {
            Inner::Bytes(bytes) if bytes.is_empty() => Ok(WireBody::Empty),
            Inner::Bytes(bytes) => Ok(WireBody::Full(bytes.clone())),
            Inner::File { path, len } => Ok(WireBody::Stream {
                len: *len,
                stream: file_stream(path.clone()),
            }),
            Inner::Stream { len, stream } => match stream.take() {
                Some(stream) => Ok(WireBody::Stream { len: *len, stream }),
                None => Err(error::body("request body stream already consumed")),
            },
            Inner::Multipart(form) => Ok(WireBody::Stream {
                len: form.content_length(),
                stream: form.stream(),
            }),
        }
    }
}

/// Open lazily so a body built long before the send still reads fresh.
fn file_stream(path: PathBuf) -> BoxStream<'static, Result<Bytes, Error>> {
    futures_util::stream::once(async move {
        let file = tokio::fs::File::open(&path).await.map_err(error::body_source)?;
        Ok::<_, Error>(
            ReaderStream::with_capacity(file, FILE_CHUNK_SIZE).map_err(error::body_source),
        )
    })
    .try_flatten()
    .boxed()
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            inner: Inner::Bytes(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(bytes))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Bytes(bytes) => f.debug_tuple("Body::Bytes").field(&bytes.len()).finish(),
            Inner::File { path, len } => f
                .debug_struct("Body::File")
                .field("path", path)
                .field("len", len)
                .finish(),
            Inner::Stream { len, stream } => f
                .debug_struct("Body::Stream")
                .field("len", len)
                .field("consumed", &stream.is_none())
                .finish(),
            Inner::Multipart(_) => f.debug_tuple("Body::Multipart").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    async fn drain(body: &mut Body) -> Vec<u8> {
        let mut out = Vec::new();
        match body.wire().unwrap() {
            WireBody::Empty => {}
            WireBody::Full(bytes) => out.extend_from_slice(&bytes),
            WireBody::Stream { mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk.unwrap());
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn bytes_body_is_rewindable() {
        let mut body = Body::from("hello");
        assert_eq!(body.content_length(), 5);
        assert!(body.rewindable());
        assert_eq!(drain(&mut body).await, b"hello");
        body.rewind().unwrap();
        assert_eq!(drain(&mut body).await, b"hello");
    }

    #[tokio::test]
    async fn file_body_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut body = Body::from_file(&path).await.unwrap();
        assert_eq!(body.content_length(), 10);
        assert_eq!(drain(&mut body).await, b"0123456789");
        body.rewind().unwrap();
        assert_eq!(drain(&mut body).await, b"0123456789");
    }

    #[tokio::test]
    async fn one_shot_stream_cannot_rewind() {
        let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(b"ab"))];
        let mut body = Body::sized_stream(2, stream::iter(chunks));
        assert!(!body.rewindable());
        assert_eq!(drain(&mut body).await, b"ab");
        assert!(body.rewind().unwrap_err().is_unrewindable_body());
        assert!(body.wire().unwrap_err().is_body());
    }
}
