//! Redirect policy helpers: deriving the next URL and method from a
//! redirect response.

use http::{Method, StatusCode};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use url::Url;

use crate::error::{self, Error};

/// Characters that may not appear raw in a request target. `Location`
/// values are re-encoded with this set before parsing, leaving existing
/// percent escapes alone.
const ILLEGAL_IN_URI: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Resolve the `Location` of a redirect against the URL it came from.
///
/// Handles scheme-relative (`//host/...`) and relative references, and
/// percent re-encodes characters servers like to leave raw.
pub(crate) fn next_url(base: &Url, location: &str) -> Result<Url, Error> {
    let location = location.trim();
    let requoted = utf8_percent_encode(location, ILLEGAL_IN_URI).to_string();
    let candidate = if requoted.starts_with("//") {
        format!("{}:{}", base.scheme(), requoted)
    } else {
        requoted
    };
    match Url::parse(&candidate) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            base.join(&candidate).map_err(error::builder)
        }
        Err(e) => Err(error::builder(e)),
    }
}

/// The method for the next hop.
///
/// 303 turns anything but HEAD into GET; 302 gets the browser treatment
/// and does the same; a 301 answer to POST becomes GET as well. 307 and
/// 308 preserve the method.
pub(crate) fn next_method(status: StatusCode, method: &Method) -> Method {
    let mut method = method.clone();
    if status == StatusCode::SEE_OTHER && method != Method::HEAD {
        method = Method::GET;
    }
    if status == StatusCode::FOUND && method != Method::HEAD {
        method = Method::GET;
    }
    if status == StatusCode::MOVED_PERMANENTLY && method == Method::POST {
        method = Method::GET;
    }
    method
}

/// Whether the status preserves method and body on redirect.
pub(crate) fn preserves_body(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://example.com/a/b?q=1").unwrap()
    }

    #[test]
    fn absolute_location() {
        let url = next_url(&base(), "http://other.example/x").unwrap();
        assert_eq!(url.as_str(), "http://other.example/x");
    }

    #[test]
    fn relative_location_joins() {
        let url = next_url(&base(), "/redirect/2").unwrap();
        assert_eq!(url.as_str(), "http://example.com/redirect/2");

        let url = next_url(&base(), "c").unwrap();
        assert_eq!(url.as_str(), "http://example.com/a/c");
    }

    #[test]
    fn scheme_relative_location() {
        let url = next_url(&base(), "//other.example/x").unwrap();
        assert_eq!(url.as_str(), "http://other.example/x");
    }

    #[test]
    fn raw_characters_are_requoted() {
        let url = next_url(&base(), "/path with space?v=a|b").unwrap();
        assert_eq!(url.path(), "/path%20with%20space");
        assert_eq!(url.query(), Some("v=a%7Cb"));
    }

    #[test]
    fn empty_location_resolves_to_base() {
        let url = next_url(&base(), "").unwrap();
        assert_eq!(url.as_str(), base().as_str());
    }

    #[test]
    fn method_derivation() {
        assert_eq!(next_method(StatusCode::SEE_OTHER, &Method::POST), Method::GET);
        assert_eq!(next_method(StatusCode::SEE_OTHER, &Method::HEAD), Method::HEAD);
        assert_eq!(next_method(StatusCode::FOUND, &Method::POST), Method::GET);
        assert_eq!(next_method(StatusCode::FOUND, &Method::DELETE), Method::GET);
        assert_eq!(
            next_method(StatusCode::MOVED_PERMANENTLY, &Method::POST),
            Method::GET
        );
        assert_eq!(
            next_method(StatusCode::MOVED_PERMANENTLY, &Method::PUT),
            Method::PUT
        );
        assert_eq!(
            next_method(StatusCode::TEMPORARY_REDIRECT, &Method::POST),
            Method::POST
        );
        assert_eq!(
            next_method(StatusCode::PERMANENT_REDIRECT, &Method::POST),
            Method::POST
        );
    }
}
