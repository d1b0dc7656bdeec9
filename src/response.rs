//! Responses and their lazy body streams.
//!
//! A response is either *buffered* (the adapter already drained the body
//! and disposed of the connection) or *streaming* (the body is a lazy,
//! finite, single-consumer chunk sequence that releases or closes the
//! connection when it finishes). Consuming a streaming body twice is an
//! error; closing an unconsumed one closes the connection.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;
use futures_util::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use http::{StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    conn::Connection,
    error::{self, Error},
    header::{HeaderMap, name},
    proto::{decode::Decoder, parse::{BodyReader, ResponseHead}},
};

const DEFAULT_ITER_CHUNK_SIZE: usize = 4 * 1024;

/// A server's response to an HTTP request.
pub struct Response {
    status: StatusCode,
    version: Version,
    reason: String,
    headers: HeaderMap,
    url: Url,
    keep_alive: bool,
    elapsed: Duration,
    history: Vec<Response>,
    body: BodyState,
}

enum BodyState {
    Streaming {
        conn: Connection,
        reader: BodyReader,
        decoder: Option<Decoder>,
    },
    Buffered {
        content: Bytes,
    },
    Consumed,
}

impl Response {
    pub(crate) fn streaming(
        head: ResponseHead,
        url: Url,
        conn: Connection,
        reader: BodyReader,
        decoder: Option<Decoder>,
    ) -> Response {
        Response {
            status: head.status,
            version: head.version,
            reason: head.reason,
            headers: head.headers,
            url,
            keep_alive: head.keep_alive,
            elapsed: Duration::ZERO,
            history: Vec::new(),
            body: BodyState::Streaming {
                conn,
                reader,
                decoder,
            },
        }
    }

    pub(crate) fn buffered(head: ResponseHead, url: Url, content: Bytes) -> Response {
        Response {
            status: head.status,
            version: head.version,
            reason: head.reason,
            headers: head.headers,
            url,
            keep_alive: head.keep_alive,
            elapsed: Duration::ZERO,
            history: Vec::new(),
            body: BodyState::Buffered { content },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The reason phrase from the status line.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL of this response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the server permits reusing the connection.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Time between sending the request and the parsed response head.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub(crate) fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    /// Prior responses of the redirect chain, oldest first.
    pub fn history(&self) -> &[Response] {
        &self.history
    }

    pub(crate) fn history_mut(&mut self) -> &mut Vec<Response> {
        &mut self.history
    }

    pub(crate) fn set_history(&mut self, history: Vec<Response>) {
        self.history = history;
    }

    /// Raw `Set-Cookie` values sent with this response.
    pub fn cookies(&self) -> impl Iterator<Item = &str> {
        self.headers.get_all(name::SET_COOKIE)
    }

    /// Whether this response is a redirect that carries a `Location`.
    pub fn is_redirect(&self) -> bool {
        matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308)
            && self.headers.contains_key(name::LOCATION)
    }

    /// The charset advertised by `Content-Type`, with the classic
    /// ISO-8859-1 fallback for text types.
    pub fn encoding(&self) -> Option<String> {
        let content_type = self.headers.get(name::CONTENT_TYPE)?;
        let mime: mime::Mime = content_type.parse().ok()?;
        if let Some(charset) = mime.get_param(mime::CHARSET) {
            return Some(charset.as_str().to_owned());
        }
        if mime.type_() == mime::TEXT {
            return Some("ISO-8859-1".to_owned());
        }
        None
    }

    fn text_encoding(&self) -> &'static Encoding {
        self.encoding()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(encoding_rs::UTF_8)
    }

    /// The already buffered body.
    ///
    /// Only available when the body was read eagerly (`stream` off) or
    /// after `bytes()`. A streaming body must be consumed first.
    pub fn content(&self) -> Result<&Bytes, Error> {
        match &self.body {
            BodyState::Buffered { content } => Ok(content),
            BodyState::Streaming { .. } => {
                Err(error::state("response content was not read; consume the body first"))
            }
            BodyState::Consumed => Err(error::state("response content was already consumed")),
        }
    }

    /// The full body as bytes, draining the stream if necessary.
    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        match std::mem::replace(&mut self.body, BodyState::Consumed) {
            BodyState::Buffered { content } => Ok(content),
            BodyState::Consumed => Err(error::stream_consumed()),
            BodyState::Streaming {
                mut conn,
                mut reader,
                mut decoder,
            } => {
                match drain_body(&mut conn, &mut reader, decoder.as_mut()).await {
                    Ok(content) => {
                        dispose(&mut conn, self.keep_alive);
                        Ok(content)
                    }
                    Err(e) => {
                        conn.close();
                        Err(e)
                    }
                }
            }
        }
    }

    /// The body decoded as text, honoring the response charset.
    pub async fn text(self) -> Result<String, Error> {
        let encoding = self.text_encoding();
        let bytes = self.bytes().await?;
        let (text, _, _) = encoding.decode(&bytes);
        Ok(text.into_owned())
    }

    /// Deserialize the body as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(error::decode)
    }

    /// Iterate over the body as a stream of byte chunks.
    ///
    /// `chunk_size` bounds each socket read. A streaming body can be
    /// iterated once; iterating again yields a stream-consumed error.
    /// Protocol and decoder failures are re-wrapped the way a body
    /// consumer sees them. Once the final chunk is delivered, the
    /// connection is released (keep-alive) or closed.
    pub fn iter_content(&mut self, chunk_size: Option<usize>) -> BodyStream {
        match std::mem::replace(&mut self.body, BodyState::Consumed) {
            BodyState::Buffered { content } => {
                // buffered content can be re-iterated, keep it
                self.body = BodyState::Buffered {
                    content: content.clone(),
                };
                BodyStream {
                    inner: slices(content, chunk_size.unwrap_or(DEFAULT_ITER_CHUNK_SIZE)),
                }
            }
            BodyState::Consumed => BodyStream {
                inner: stream::once(std::future::ready(Err(error::stream_consumed()))).boxed(),
            },
            BodyState::Streaming {
                conn,
                mut reader,
                decoder,
            } => {
                if let Some(size) = chunk_size {
                    reader.set_read_size(size);
                }
                BodyStream {
                    inner: streaming_chunks(conn, reader, decoder, self.keep_alive),
                }
            }
        }
    }

    /// Iterate over the body one line at a time, decoded with the
    /// response charset. Lines are split on `\n` with a trailing `\r`
    /// stripped.
    pub fn iter_lines(&mut self) -> LineStream {
        let encoding = self.text_encoding();
        LineStream {
            inner: self.iter_content(None),
            pending: BytesMut::new(),
            encoding,
            done: false,
        }
    }

    /// Iterate over the body as decoded text chunks.
    pub fn iter_text(&mut self, chunk_size: Option<usize>) -> TextStream {
        let encoding = self.text_encoding();
        TextStream {
            inner: self.iter_content(chunk_size),
            decoder: encoding.new_decoder(),
            done: false,
        }
    }

    /// Dispose of the connection.
    ///
    /// An unconsumed streaming body closes its connection rather than
    /// returning it to the pool. Idempotent.
    pub async fn close(&mut self) {
        if let BodyState::Streaming { mut conn, .. } =
            std::mem::replace(&mut self.body, BodyState::Consumed)
        {
            conn.close();
        }
    }

    /// Connection disposal state, when this response still owns one.
    /// `None` means the connection was already handed back or the body
    /// stream took it over.
    pub fn connection_state(&self) -> Option<(bool, bool)> {
        match &self.body {
            BodyState::Streaming { conn, .. } => Some((conn.is_closed(), conn.is_released())),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

fn dispose(conn: &mut Connection, keep_alive: bool) {
    if keep_alive {
        conn.release();
    } else {
        conn.close();
    }
}

/// Drain every chunk through the decoder. Errors are *not* re-wrapped
/// here; the eager path surfaces them raw.
pub(crate) async fn drain_body(
    conn: &mut Connection,
    reader: &mut BodyReader,
    mut decoder: Option<&mut Decoder>,
) -> Result<Bytes, Error> {
    let mut content = BytesMut::new();
    loop {
        match reader.next_chunk(&mut conn.transport_mut().io).await? {
            Some(chunk) => match decoder.as_deref_mut() {
                Some(decoder) => content.extend_from_slice(&decoder.feed(&chunk)?),
                None => content.extend_from_slice(&chunk),
            },
            None => {
                if let Some(decoder) = decoder.as_deref_mut() {
                    content.extend_from_slice(&decoder.finish()?);
                }
                return Ok(content.freeze());
            }
        }
    }
}

fn slices(content: Bytes, chunk_size: usize) -> BoxStream<'static, Result<Bytes, Error>> {
    let chunk_size = chunk_size.max(1);
    stream::iter(
        (0..content.len())
            .step_by(chunk_size)
            .map(move |start| {
                let end = (start + chunk_size).min(content.len());
                Ok(content.slice(start..end))
            })
            .collect::<Vec<_>>(),
    )
    .boxed()
}

struct StreamingState {
    conn: Connection,
    reader: BodyReader,
    decoder: Option<Decoder>,
    keep_alive: bool,
    done: bool,
}

/// The owned chunk stream for a streaming body. Completion disposes of
/// the connection; failure closes it and the error is re-wrapped for
/// stream consumers.
fn streaming_chunks(
    conn: Connection,
    reader: BodyReader,
    decoder: Option<Decoder>,
    keep_alive: bool,
) -> BoxStream<'static, Result<Bytes, Error>> {
    let state = StreamingState {
        conn,
        reader,
        decoder,
        keep_alive,
        done: false,
    };
    stream::try_unfold(state, |mut st| async move {
        if st.done {
            return Ok(None);
        }
        loop {
            match st.reader.next_chunk(&mut st.conn.transport_mut().io).await {
                Ok(Some(raw)) => match st.decoder.as_mut() {
                    Some(decoder) => match decoder.feed(&raw) {
                        Ok(decoded) if decoded.is_empty() => continue,
                        Ok(decoded) => return Ok(Some((decoded, st))),
                        Err(e) => {
                            st.conn.close();
                            return Err(e.into_stream_error());
                        }
                    },
                    None => return Ok(Some((raw, st))),
                },
                Ok(None) => {
                    let tail = match st.decoder.as_mut() {
                        Some(decoder) => match decoder.finish() {
                            Ok(tail) => tail,
                            Err(e) => {
                                st.conn.close();
                                return Err(e.into_stream_error());
                            }
                        },
                        None => Bytes::new(),
                    };
                    let keep_alive = st.keep_alive;
                    dispose(&mut st.conn, keep_alive);
                    st.done = true;
                    if tail.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some((tail, st)));
                }
                Err(e) => {
                    st.conn.close();
                    return Err(e.into_stream_error());
                }
            }
        }
    })
    .boxed()
}

/// Stream of body byte chunks returned by [`Response::iter_content`].
pub struct BodyStream {
    inner: BoxStream<'static, Result<Bytes, Error>>,
}

impl Stream for BodyStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Stream of decoded lines returned by [`Response::iter_lines`].
pub struct LineStream {
    inner: BodyStream,
    pending: BytesMut,
    encoding: &'static Encoding,
    done: bool,
}

impl LineStream {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line = self.pending.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let (text, _, _) = self.encoding.decode(&line);
        Some(text.into_owned())
    }
}

impl Stream for LineStream {
    type Item = Result<String, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    self.pending.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if self.pending.is_empty() {
                        return Poll::Ready(None);
                    }
                    let rest = self.pending.split();
                    let (text, _, _) = self.encoding.decode(&rest);
                    return Poll::Ready(Some(Ok(text.into_owned())));
                }
            }
        }
    }
}

/// Stream of decoded text chunks returned by [`Response::iter_text`].
pub struct TextStream {
    inner: BodyStream,
    decoder: encoding_rs::Decoder,
    done: bool,
}

impl Stream for TextStream {
    type Item = Result<String, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(item) => {
                    let last = item.is_none();
                    let chunk = match &item {
                        Some(Ok(chunk)) => &chunk[..],
                        _ => &[],
                    };
                    let mut out = String::with_capacity(
                        self.decoder
                            .max_utf8_buffer_length(chunk.len())
                            .unwrap_or(chunk.len()),
                    );
                    let this = self.as_mut().get_mut();
                    let (_, _, _) = this.decoder.decode_to_string(chunk, &mut out, last);
                    if last {
                        this.done = true;
                        if out.is_empty() {
                            return Poll::Ready(None);
                        }
                    }
                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(out)));
                    }
                }
            }
        }
    }
}
