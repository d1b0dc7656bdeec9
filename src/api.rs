//! Free convenience functions.
//!
//! Each call spins up a throwaway [`Session`], sends one request, and
//! closes the session before returning, so the response is always fully
//! buffered. Use a [`Session`] directly to stream bodies or reuse
//! connections across requests.

use http::Method;

use crate::{Body, Response, Result, Session};

/// Send one request with a throwaway session.
pub async fn request(method: Method, url: impl AsRef<str>) -> Result<Response> {
    let session = Session::new();
    let result = session.request(method, url).send().await;
    session.close().await;
    result
}

async fn request_with_body(
    method: Method,
    url: impl AsRef<str>,
    body: impl Into<Body>,
) -> Result<Response> {
    let session = Session::new();
    let result = session.request(method, url).body(body).send().await;
    session.close().await;
    result
}

/// `GET` a URL.
pub async fn get(url: impl AsRef<str>) -> Result<Response> {
    request(Method::GET, url).await
}

/// `HEAD` a URL.
pub async fn head(url: impl AsRef<str>) -> Result<Response> {
    request(Method::HEAD, url).await
}

/// `OPTIONS` a URL.
pub async fn options(url: impl AsRef<str>) -> Result<Response> {
    request(Method::OPTIONS, url).await
}

/// `DELETE` a URL.
pub async fn delete(url: impl AsRef<str>) -> Result<Response> {
    request(Method::DELETE, url).await
}

/// `POST` a body to a URL.
pub async fn post(url: impl AsRef<str>, body: impl Into<Body>) -> Result<Response> {
    request_with_body(Method::POST, url, body).await
}

/// `PUT` a body to a URL.
pub async fn put(url: impl AsRef<str>, body: impl Into<Body>) -> Result<Response> {
    request_with_body(Method::PUT, url, body).await
}

/// `PATCH` a body to a URL.
pub async fn patch(url: impl AsRef<str>, body: impl Into<Body>) -> Result<Response> {
    request_with_body(Method::PATCH, url, body).await
}
