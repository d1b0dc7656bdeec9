//! Incremental HTTP/1.1 response parsing.
//!
//! The parser reads from the socket in bounded slices, feeding httparse
//! until the header section completes, then hands off a [`BodyReader`]
//! that frames the remaining bytes by content length, chunked coding, or
//! end of stream. Every socket read is wrapped by the read timeout.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{StatusCode, Version};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};

use crate::{
    error::{self, Error},
    header::{HeaderMap, name, value_has_token},
};

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;
pub(crate) const MAX_BUFFER_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Everything known about a response once its header section parsed.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub keep_alive: bool,
}

/// Read up to `max` bytes into `buf`, honoring the read timeout.
pub(crate) async fn read_some<T>(
    io: &mut T,
    buf: &mut BytesMut,
    max: usize,
    read_timeout: Option<Duration>,
) -> Result<usize, Error>
where
    T: AsyncRead + Unpin,
{
    buf.reserve(max);
    let mut limited = AsyncReadExt::take(&mut *io, max as u64);
    let read = limited.read_buf(buf);
    let result = match read_timeout {
        Some(dur) => match timeout(dur, read).await {
            Ok(result) => result,
            Err(_) => return Err(error::read_timeout()),
        },
        None => read.await,
    };
    result.map_err(error::connect)
}

pub(crate) struct ResponseParser {
    read_size: usize,
    read_timeout: Option<Duration>,
    head_response: bool,
}

impl ResponseParser {
    pub(crate) fn new(read_timeout: Option<Duration>) -> ResponseParser {
        ResponseParser {
            read_size: DEFAULT_BUFFER_SIZE,
            read_timeout,
            head_response: false,
        }
    }

    /// Responses to HEAD (and CONNECT) requests carry headers only.
    pub(crate) fn head_response(mut self, yes: bool) -> ResponseParser {
        self.head_response = yes;
        self
    }

    /// Drive reads until the header section completes.
    ///
    /// EOF before that point is a protocol error. Body bytes that arrived
    /// with the final header read carry over into the returned reader.
    pub(crate) async fn parse<T>(self, io: &mut T) -> Result<(ResponseHead, BodyReader), Error>
    where
        T: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.read_size);
        loop {
            if let Some((mut head, consumed)) = try_parse_head(&buf)? {
                buf.advance(consumed);
                let framing = body_framing(&head, self.head_response)?;
                if matches!(framing, Framing::UntilEof) {
                    // nothing frames the body, so the connection cannot
                    // outlive it
                    head.keep_alive = false;
                }
                let reader = BodyReader {
                    buf,
                    framing,
                    read_size: self.read_size,
                    read_timeout: self.read_timeout,
                    completed: false,
                };
                return Ok((head, reader));
            }
            let n = read_some(io, &mut buf, self.read_size, self.read_timeout).await?;
            if n == 0 {
                return Err(error::protocol("incomplete response headers"));
            }
        }
    }
}

fn try_parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, Error> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_slots);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let version = match parsed.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                _ => return Err(error::protocol("unsupported HTTP version")),
            };
            let status = parsed
                .code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| error::protocol("invalid status code"))?;
            let reason = parsed.reason.unwrap_or("").to_owned();
            let mut headers = HeaderMap::with_capacity(parsed.headers.len());
            for h in parsed.headers.iter() {
                headers.append(h.name, String::from_utf8_lossy(h.value).into_owned());
            }
            let keep_alive = connection_keep_alive(version, &headers);
            Ok(Some((
                ResponseHead {
                    version,
                    status,
                    reason,
                    headers,
                    keep_alive,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(error::protocol_source(e)),
    }
}

/// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
/// requires an explicit `Connection: keep-alive`.
fn connection_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers.get(name::CONNECTION);
    match version {
        Version::HTTP_11 => !connection.is_some_and(|v| value_has_token(v, "close")),
        Version::HTTP_10 => connection.is_some_and(|v| value_has_token(v, "keep-alive")),
        _ => false,
    }
}

/// Parse `Content-Length`, tolerating repeats as long as every value
/// agrees. Anything else is malformed.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, Error> {
    let mut length: Option<u64> = None;
    let mut present = false;
    for value in headers.get_all(name::CONTENT_LENGTH) {
        present = true;
        for part in value.split(',') {
            let n = from_digits(part.trim().as_bytes())
                .ok_or_else(|| error::protocol("invalid content-length"))?;
            match length {
                None => length = Some(n),
                Some(prev) if prev == n => {}
                Some(_) => return Err(error::protocol("conflicting content-length values")),
            }
        }
    }
    if present && length.is_none() {
        return Err(error::protocol("invalid content-length"));
    }
    Ok(length)
}

fn from_digits(bytes: &[u8]) -> Option<u64> {
    // a signed prefix would parse with FromStr, so walk the digits by hand
    if bytes.is_empty() {
        return None;
    }
    let mut result = 0u64;
    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(10)?;
                result = result.checked_add(u64::from(b - b'0'))?;
            }
            _ => return None,
        }
    }
    Some(result)
}

/// `chunked` must be the final transfer coding to frame the body.
fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    let Some(last_value) = headers.get_all(name::TRANSFER_ENCODING).last() else {
        return false;
    };
    last_value
        .rsplit(',')
        .next()
        .is_some_and(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn body_framing(head: &ResponseHead, head_response: bool) -> Result<Framing, Error> {
    if head_response
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }
    if transfer_encoding_is_chunked(&head.headers) {
        return Ok(Framing::Chunked(ChunkedDecoder::new()));
    }
    match content_length(&head.headers)? {
        Some(n) => Ok(Framing::Length { remaining: n }),
        None => Ok(Framing::UntilEof),
    }
}

#[derive(Debug)]
enum Framing {
    Empty,
    Length { remaining: u64 },
    UntilEof,
    Chunked(ChunkedDecoder),
}

/// Pulls body chunks off the socket, in network order, until the framing
/// says the message is complete. Single consumer; not restartable.
#[derive(Debug)]
pub(crate) struct BodyReader {
    buf: BytesMut,
    framing: Framing,
    read_size: usize,
    read_timeout: Option<Duration>,
    completed: bool,
}

impl BodyReader {
    /// Caller controlled per-read size, clamped to the buffer cap.
    pub(crate) fn set_read_size(&mut self, size: usize) {
        self.read_size = size.clamp(1, MAX_BUFFER_SIZE);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    /// The next body chunk, or `None` once the message is complete.
    ///
    /// EOF before completion is a protocol error, except for bodies that
    /// are framed by the connection closing.
    pub(crate) async fn next_chunk<T>(&mut self, io: &mut T) -> Result<Option<Bytes>, Error>
    where
        T: AsyncRead + Unpin,
    {
        if self.completed {
            return Ok(None);
        }
        match &mut self.framing {
            Framing::Empty => {
                self.completed = true;
                Ok(None)
            }
            Framing::Length { remaining } => {
                if *remaining == 0 {
                    self.completed = true;
                    return Ok(None);
                }
                if self.buf.is_empty() {
                    let n = read_some(io, &mut self.buf, self.read_size, self.read_timeout).await?;
                    if n == 0 {
                        return Err(error::protocol("incomplete response body"));
                    }
                }
                let take = (*remaining).min(self.buf.len() as u64) as usize;
                *remaining -= take as u64;
                if *remaining == 0 {
                    self.completed = true;
                }
                Ok(Some(self.buf.split_to(take).freeze()))
            }
            Framing::UntilEof => {
                if !self.buf.is_empty() {
                    return Ok(Some(self.buf.split().freeze()));
                }
                let n = read_some(io, &mut self.buf, self.read_size, self.read_timeout).await?;
                if n == 0 {
                    self.completed = true;
                    return Ok(None);
                }
                Ok(Some(self.buf.split().freeze()))
            }
            Framing::Chunked(decoder) => loop {
                match decoder.decode(&mut self.buf)? {
                    ChunkStep::Data(bytes) => return Ok(Some(bytes)),
                    ChunkStep::Finished => {
                        self.completed = true;
                        return Ok(None);
                    }
                    ChunkStep::NeedMore => {
                        let n =
                            read_some(io, &mut self.buf, self.read_size, self.read_timeout).await?;
                        if n == 0 {
                            return Err(error::protocol("incomplete response body"));
                        }
                    }
                }
            },
        }
    }

    /// Leftover raw bytes, used to assert clean CONNECT handshakes.
    pub(crate) fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

enum ChunkStep {
    Data(Bytes),
    NeedMore,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkState {
    Size,
    SizeExt,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    End,
}

/// Incremental decoder for the chunked transfer coding. Extensions and
/// trailers are consumed and discarded.
#[derive(Debug)]
struct ChunkedDecoder {
    state: ChunkState,
    size: u64,
    digits: u8,
}

impl ChunkedDecoder {
    fn new() -> ChunkedDecoder {
        ChunkedDecoder {
            state: ChunkState::Size,
            size: 0,
            digits: 0,
        }
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<ChunkStep, Error> {
        loop {
            if self.state == ChunkState::End {
                return Ok(ChunkStep::Finished);
            }
            if self.state == ChunkState::Data {
                if buf.is_empty() {
                    return Ok(ChunkStep::NeedMore);
                }
                let take = self.size.min(buf.len() as u64) as usize;
                self.size -= take as u64;
                if self.size == 0 {
                    self.state = ChunkState::DataCr;
                }
                return Ok(ChunkStep::Data(buf.split_to(take).freeze()));
            }
            if buf.is_empty() {
                return Ok(ChunkStep::NeedMore);
            }
            let byte = buf.split_to(1)[0];
            self.state = match self.state {
                ChunkState::Size => match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        if self.size > u64::MAX / 16 {
                            return Err(error::protocol("chunk size overflow"));
                        }
                        self.size = self.size * 16 + u64::from(hex_value(byte));
                        self.digits += 1;
                        ChunkState::Size
                    }
                    b';' if self.digits > 0 => ChunkState::SizeExt,
                    b'\r' if self.digits > 0 => ChunkState::SizeLf,
                    _ => return Err(error::protocol("invalid chunk size")),
                },
                ChunkState::SizeExt => match byte {
                    b'\r' => ChunkState::SizeLf,
                    _ => ChunkState::SizeExt,
                },
                ChunkState::SizeLf => match byte {
                    b'\n' if self.size == 0 => ChunkState::TrailerStart,
                    b'\n' => ChunkState::Data,
                    _ => return Err(error::protocol("invalid chunk size line")),
                },
                ChunkState::DataCr => match byte {
                    b'\r' => ChunkState::DataLf,
                    _ => return Err(error::protocol("missing chunk terminator")),
                },
                ChunkState::DataLf => match byte {
                    b'\n' => {
                        self.digits = 0;
                        ChunkState::Size
                    }
                    _ => return Err(error::protocol("missing chunk terminator")),
                },
                ChunkState::TrailerStart => match byte {
                    b'\r' => ChunkState::EndLf,
                    _ => ChunkState::Trailer,
                },
                ChunkState::Trailer => match byte {
                    b'\r' => ChunkState::TrailerLf,
                    _ => ChunkState::Trailer,
                },
                ChunkState::TrailerLf => match byte {
                    b'\n' => ChunkState::TrailerStart,
                    _ => return Err(error::protocol("invalid trailer section")),
                },
                ChunkState::EndLf => match byte {
                    b'\n' => ChunkState::End,
                    _ => return Err(error::protocol("invalid trailer section")),
                },
                ChunkState::Data | ChunkState::End => unreachable!(),
            };
        }
    }
}

fn hex_value(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        _ => byte - b'A' + 10,
    }
}
