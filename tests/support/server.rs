//! A scripted HTTP/1.1 test server over a plain TCP listener.
//!
//! Each accepted connection reads requests in a loop and feeds them to
//! the handler. The handler scripts the exact reply bytes, whether the
//! connection stays open, and optional artificial delays, which is all
//! the client tests need to exercise keep-alive, disposal and timeout
//! behavior deterministically.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// A parsed incoming request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A scripted reply.
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    /// Skip the automatic Content-Length header.
    omit_length: bool,
    /// Advertise `Connection: close` and close after writing.
    close_header: bool,
    /// Close the socket after writing without announcing it.
    drop_socket: bool,
    /// Stall before writing anything.
    delay: Option<Duration>,
    /// Completely custom wire bytes, overriding everything above.
    raw: Option<Vec<u8>>,
}

impl Reply {
    pub fn status(status: u16) -> Reply {
        Reply {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            omit_length: false,
            close_header: false,
            drop_socket: false,
            delay: None,
            raw: None,
        }
    }

    pub fn ok() -> Reply {
        Reply::status(200)
    }

    pub fn raw(bytes: impl Into<Vec<u8>>) -> Reply {
        let mut reply = Reply::status(200);
        reply.raw = Some(bytes.into());
        reply
    }

    pub fn header(mut self, name: &str, value: &str) -> Reply {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Reply {
        self.body = body.into();
        self
    }

    pub fn json(self, value: &serde_json::Value) -> Reply {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }

    /// Send the body without a Content-Length, framing it by EOF.
    pub fn unframed_body(mut self, body: impl Into<Vec<u8>>) -> Reply {
        self.body = body.into();
        self.omit_length = true;
        self.drop_socket = true;
        self
    }

    /// Chunked transfer coding.
    pub fn chunked(mut self, chunks: &[&[u8]]) -> Reply {
        let mut body = Vec::new();
        for chunk in chunks {
            body.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            body.extend_from_slice(chunk);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"0\r\n\r\n");
        self.body = body;
        self.omit_length = true;
        self.headers
            .push(("Transfer-Encoding".to_owned(), "chunked".to_owned()));
        self
    }

    /// Announce `Connection: close` and close after this reply.
    pub fn close(mut self) -> Reply {
        self.close_header = true;
        self
    }

    /// Close the socket after replying without telling the client.
    pub fn hang_up(mut self) -> Reply {
        self.drop_socket = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Reply {
        self.delay = Some(delay);
        self
    }

    fn ends_connection(&self) -> bool {
        self.close_header || self.drop_socket
    }

    fn encode(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let reason = match self.status {
            200 => "OK",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Status",
        };
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.omit_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        if self.close_header {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Handle to a running test server.
pub struct Server {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://127.0.0.1:port{path}`
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Same server, reached through the `localhost` name. A different
    /// pool key than [`Server::url`].
    pub fn localhost_url(&self, path: &str) -> String {
        format!("http://localhost:{}{}", self.addr.port(), path)
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of requests served so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Start a server; the handler scripts one reply per request.
pub async fn spawn<F>(handler: F) -> Server
where
    F: Fn(Request) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let conn_counter = connections.clone();
    let req_counter = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conn_counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            let req_counter = req_counter.clone();
            tokio::spawn(async move {
                serve_connection(stream, handler, req_counter).await;
            });
        }
    });

    Server {
        addr,
        connections,
        requests,
    }
}

async fn serve_connection<F>(mut stream: TcpStream, handler: Arc<F>, requests: Arc<AtomicUsize>)
where
    F: Fn(Request) -> Reply + Send + Sync + 'static,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let Some(request) = read_request(&mut stream, &mut buf).await else {
            return;
        };
        requests.fetch_add(1, Ordering::SeqCst);
        let reply = handler(request);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if stream.write_all(&reply.encode()).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
        if reply.ends_connection() {
            return;
        }
    }
}

async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Request> {
    // headers first
    let head_end = loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            break pos;
        }
        if !read_more(stream, buf).await {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_owned();
    let target = parts.next()?.to_owned();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect();

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        if !read_more(stream, buf).await {
            return None;
        }
    }
    let body = buf[body_start..body_start + content_length].to_vec();
    buf.drain(..body_start + content_length);

    Some(Request {
        method,
        target,
        headers,
        body,
    })
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut tmp = [0u8; 4096];
    match stream.read(&mut tmp).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&tmp[..n]);
            true
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
