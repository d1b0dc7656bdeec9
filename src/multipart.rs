//! Multipart form bodies.
//!
//! A [`Form`] is an ordered list of parts behind one boundary. The total
//! body length is computed up front from part metadata, so multipart
//! uploads always travel with an exact `Content-Length` and never fall
//! back to chunked transfer.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::{fs::File, io::AsyncReadExt};

use crate::{
    error::{self, Error},
    header::{HeaderMap, name},
};

const CRLF: &[u8] = b"\r\n";
const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// Everything but the characters `quote(name, safe='')` style encoding
/// leaves alone.
const FIELD_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'-')
    .remove(b'.')
    .remove(b'~');

/// A multipart/form-data body.
#[derive(Debug)]
pub struct Form {
    boundary: String,
    parts: Vec<Part>,
}

/// One field of a multipart form.
#[derive(Debug)]
pub struct Part {
    name: String,
    filename: Option<String>,
    headers: HeaderMap,
    payload: Payload,
}

#[derive(Debug, Clone)]
enum Payload {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl Part {
    fn new(name: &str, payload: Payload) -> Part {
        Part {
            name: utf8_percent_encode(name, FIELD_NAME).to_string(),
            filename: None,
            headers: HeaderMap::new(),
            payload,
        }
    }

    /// An inline text field.
    pub fn text(name: &str, value: impl Into<String>) -> Part {
        Part::new(name, Payload::Bytes(Bytes::from(value.into())))
    }

    /// An inline binary field.
    pub fn bytes(name: &str, value: impl Into<Bytes>) -> Part {
        Part::new(name, Payload::Bytes(value.into()))
    }

    /// A field streamed from a file on disk.
    ///
    /// The file is sized now and opened again each time the form is
    /// serialized, which is what makes a file part replayable after a
    /// redirect.
    pub async fn file(name: &str, path: impl AsRef<Path>) -> Result<Part, Error> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path)
            .await
            .map_err(error::body_source)?
            .len();
        let mut part = Part::new(name, Payload::File { path: path.clone(), len });
        if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
            part = part.file_name(file_name);
        }
        Ok(part)
    }

    /// Set (or override) the filename sent in `Content-Disposition`.
    pub fn file_name(mut self, filename: impl AsRef<str>) -> Part {
        self.filename = Some(utf8_percent_encode(filename.as_ref(), FIELD_NAME).to_string());
        self
    }

    /// Set an explicit `Content-Type` for this part.
    pub fn mime_str(mut self, mime: &str) -> Part {
        self.headers.insert(name::CONTENT_TYPE, mime);
        self
    }

    /// Add an extra header to this part.
    pub fn header(mut self, header_name: &str, value: &str) -> Part {
        self.headers.insert(header_name, value);
        self
    }

    fn payload_len(&self) -> u64 {
        match &self.payload {
            Payload::Bytes(bytes) => bytes.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }

    /// Part headers in wire form, with `Content-Disposition` last so the
    /// caller supplied headers keep their position.
    fn encoded_headers(&self) -> Bytes {
        let mut headers = self.headers.clone();
        if !headers.contains_key(name::CONTENT_TYPE) {
            if let Some(filename) = &self.filename {
                if let Some(mime) = mime_guess::from_path(filename).first_raw() {
                    headers.insert(name::CONTENT_TYPE, mime);
                }
            }
        }
        let mut disposition = format!("form-data; name=\"{}\"", self.name);
        if let Some(filename) = &self.filename {
            disposition.push_str(&format!("; filename=\"{filename}\""));
        }
        headers.insert("Content-Disposition", disposition);

        let mut out = BytesMut::new();
        let mut first = true;
        for (n, v) in headers.iter() {
            if !first {
                out.extend_from_slice(CRLF);
            }
            first = false;
            out.extend_from_slice(n.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
        }
        out.freeze()
    }
}

impl Form {
    pub fn new() -> Form {
        Form {
            boundary: format!("{:032x}", rand::random::<u128>()),
            parts: Vec::new(),
        }
    }

    /// Add a text field.
    pub fn text(mut self, field_name: &str, value: impl Into<String>) -> Form {
        self.parts.push(Part::text(field_name, value));
        self
    }

    /// Add a prepared part.
    pub fn part(mut self, part: Part) -> Form {
        self.parts.push(part);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub(crate) fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// The exact number of body bytes the serializer will emit.
    pub(crate) fn content_length(&self) -> u64 {
        let eol = CRLF.len() as u64;
        let boundary = self.boundary.len() as u64;
        let mut length = 0;
        for part in &self.parts {
            length += 2 + boundary + eol;
            length += part.encoded_headers().len() as u64 + eol;
            length += eol;
            length += part.payload_len() + eol;
        }
        length + 2 + boundary + 2 + eol
    }

    /// The body as a lazy chunk sequence. File payloads are opened when
    /// their part is reached.
    pub(crate) fn stream(&self) -> BoxStream<'static, Result<Bytes, Error>> {
        let plans: Vec<(Bytes, Payload)> = self
            .parts
            .iter()
            .map(|part| (part.encoded_headers(), part.payload.clone()))
            .collect();
        let boundary = Bytes::from(self.boundary.clone());

        let init = (plans, boundary, State::PartHeader(0));
        Box::pin(stream::try_unfold(init, |(plans, boundary, state)| async move {
            let mut state = state;
            loop {
                match state {
                    State::PartHeader(i) => {
                        let Some((headers, _)) = plans.get(i) else {
                            state = State::Final;
                            continue;
                        };
                        let mut chunk = BytesMut::with_capacity(headers.len() + boundary.len() + 8);
                        chunk.extend_from_slice(b"--");
                        chunk.extend_from_slice(&boundary);
                        chunk.extend_from_slice(CRLF);
                        chunk.extend_from_slice(headers);
                        chunk.extend_from_slice(CRLF);
                        chunk.extend_from_slice(CRLF);
                        return Ok(Some((
                            chunk.freeze(),
                            (plans, boundary, State::PartPayload(i)),
                        )));
                    }
                    State::PartPayload(i) => match &plans[i].1 {
                        Payload::Bytes(bytes) => {
                            let chunk = bytes.clone();
                            state = State::PartEnd(i);
                            if chunk.is_empty() {
                                continue;
                            }
                            return Ok(Some((chunk, (plans, boundary, State::PartEnd(i)))));
                        }
                        Payload::File { path, .. } => {
                            let file = File::open(path).await.map_err(error::body_source)?;
                            state = State::PartFile(i, file);
                        }
                    },
                    State::PartFile(i, mut file) => {
                        let mut chunk = BytesMut::with_capacity(FILE_CHUNK_SIZE);
                        let n = file
                            .read_buf(&mut chunk)
                            .await
                            .map_err(error::body_source)?;
                        if n == 0 {
                            state = State::PartEnd(i);
                            continue;
                        }
                        return Ok(Some((
                            chunk.freeze(),
                            (plans, boundary, State::PartFile(i, file)),
                        )));
                    }
                    State::PartEnd(i) => {
                        return Ok(Some((
                            Bytes::from_static(CRLF),
                            (plans, boundary, State::PartHeader(i + 1)),
                        )));
                    }
                    State::Final => {
                        let mut chunk = BytesMut::with_capacity(boundary.len() + 6);
                        chunk.extend_from_slice(b"--");
                        chunk.extend_from_slice(&boundary);
                        chunk.extend_from_slice(b"--");
                        chunk.extend_from_slice(CRLF);
                        return Ok(Some((chunk.freeze(), (plans, boundary, State::Done))));
                    }
                    State::Done => return Ok(None),
                }
            }
        }))
    }
}

impl Default for Form {
    fn default() -> Self {
        Form::new()
    }
}

enum State {
    PartHeader(usize),
    PartPayload(usize),
    PartFile(usize, File),
    PartEnd(usize),
    Final,
    Done,
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    async fn collect(form: &Form) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunks = form.stream();
        while let Some(chunk) = chunks.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn emitted_length_matches_computed_length() {
        let form = Form::new()
            .text("hello", "world")
            .part(Part::bytes("blob", &b"\x00\x01\x02"[..]).mime_str("application/octet-stream"));
        let body = collect(&form).await;
        assert_eq!(body.len() as u64, form.content_length());
    }

    #[tokio::test]
    async fn framing_and_disposition() {
        let form = Form::new().text("file", "test data\n");
        let body = String::from_utf8(collect(&form).await).unwrap();
        let boundary = form.boundary().to_owned();

        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.contains("Content-Disposition: form-data; name=\"file\"\r\n\r\ntest data\n\r\n"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn filename_guesses_content_type() {
        let form = Form::new().part(
            Part::bytes("report", &b"a,b\n1,2\n"[..]).file_name("report.csv"),
        );
        let body = String::from_utf8(collect(&form).await).unwrap();
        assert!(body.contains("Content-Type: text/csv"));
        assert!(body.contains("filename=\"report.csv\""));
        assert_eq!(body.len() as u64, form.content_length());
    }

    #[tokio::test]
    async fn file_part_streams_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.txt");
        std::fs::write(&path, b"test data\n").unwrap();

        let form = Form::new().part(Part::file("file", &path).await.unwrap());
        let first = collect(&form).await;
        assert_eq!(first.len() as u64, form.content_length());
        // a second serialization reopens the file
        let second = collect(&form).await;
        assert_eq!(first, second);
        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("filename=\"upload.txt\""));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.contains("test data\n"));
    }

    #[tokio::test]
    async fn field_names_are_quoted() {
        let form = Form::new().text("weird name", "v");
        let body = String::from_utf8(collect(&form).await).unwrap();
        assert!(body.contains("name=\"weird%20name\""));
        assert_eq!(body.len() as u64, form.content_length());
    }
}
