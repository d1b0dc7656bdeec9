//! # weir
//!
//! An asynchronous HTTP/1.1 client with a bounded, fair connection pool.
//!
//! Many concurrent requests multiplex over per-host keep-alive
//! connections, capped per host and globally; saturated checkouts queue
//! FIFO. The wire layer speaks HTTP/1.1 with TLS (including CONNECT
//! tunneling through forward proxies), decodes gzip and deflate bodies,
//! streams multipart uploads with exact content lengths, and follows
//! redirects with requests-style method and body rewrite rules.
//!
//! ## Example
//!
//! ```rust,ignore
//! let session = weir::Session::new();
//! let response = session
//!     .post("http://httpbin.org/post")
//!     .json(&serde_json::json!({"hello": "world"}))
//!     .send()
//!     .await?;
//! assert_eq!(response.status(), weir::StatusCode::OK);
//! let echoed: serde_json::Value = response.json().await?;
//! session.close().await;
//! ```
//!
//! Response bodies buffer eagerly by default; enable `.stream(true)` on
//! a request to consume the body lazily with
//! [`Response::iter_content`], which releases the connection back to the
//! pool once the body completes (or closes it when the server asked for
//! that).

#![cfg_attr(docsrs, feature(doc_cfg))]

mod adapter;
mod api;
mod body;
mod conn;
mod error;
mod header;
pub mod multipart;
pub mod pool;
mod proto;
mod redirect;
mod request;
mod response;
mod session;

pub use http::{Method, StatusCode, Version};
pub use url::Url;

pub use self::{
    adapter::HttpAdapter,
    api::{delete, get, head, options, patch, post, put, request},
    body::Body,
    conn::{ConnectOptions, Connection, ConnectionPool, PoolKey, Scheme},
    conn::tls::{Identity, Verify},
    error::{Error, Result},
    header::HeaderMap,
    request::{Request, RequestBuilder, Timeout},
    response::{BodyStream, LineStream, Response, TextStream},
    session::{CookieStore, Session, SessionBuilder},
};
