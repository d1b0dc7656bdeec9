//! An insertion-ordered header map.
//!
//! Lookups are case-insensitive, the original header name casing is kept
//! for wire emission, and iteration yields entries in insertion order.

use std::fmt;

/// Common header names used throughout the crate.
pub(crate) mod name {
    pub const HOST: &str = "Host";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const CONNECTION: &str = "Connection";
    pub const LOCATION: &str = "Location";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
    pub const COOKIE: &str = "Cookie";
    pub const SET_COOKIE: &str = "Set-Cookie";
}

/// A multimap of HTTP headers.
///
/// Backed by a vector of `(name, value)` pairs so the order and casing a
/// caller used survive onto the wire, while `get`/`remove` match names
/// case-insensitively.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> HeaderMap {
        HeaderMap {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert `value`, replacing any existing values for `name`.
    ///
    /// The entry keeps the position of the first replaced value, so
    /// re-setting a header does not shuffle the wire order.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(&name) {
                if replaced {
                    return false;
                }
                replaced = true;
                *v = value.clone();
            }
            true
        });
        if !replaced {
            self.entries.push((name, value));
        }
    }

    /// Add a value without touching existing entries for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Insert only when no value exists for `name` yet.
    pub fn insert_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains_key(&name) {
            self.entries.push((name, value.into()));
        }
    }

    /// Remove every value for `name`, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if removed.is_none() {
                    removed = Some(std::mem::take(v));
                }
                return false;
            }
            true
        });
        removed
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Merge `other` in, letting existing entries win.
    pub(crate) fn merge_defaults(&mut self, defaults: &HeaderMap) {
        for (name, value) in defaults.iter() {
            self.insert_if_absent(name, value);
        }
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(n, v)| (n, v)))
            .finish()
    }
}

impl<N: Into<String>, V: Into<String>> Extend<(N, V)> for HeaderMap {
    fn extend<I: IntoIterator<Item = (N, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.append(name, value);
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        map.extend(iter);
        map
    }
}

/// Splits a comma separated header value and checks for a token,
/// ignoring case. `Connection: Upgrade, close` matches `close`.
pub(crate) fn value_has_token(value: &str, needle: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup_preserves_case() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Custom-Id", "1");
        assert_eq!(headers.get("x-custom-id"), Some("1"));
        assert_eq!(headers.iter().next(), Some(("X-Custom-Id", "1")));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "*/*");
        headers.insert("User-Agent", "weir");
        headers.insert("accept", "application/json");

        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(
            entries,
            vec![("Accept", "application/json"), ("User-Agent", "weir")]
        );
    }

    #[test]
    fn append_and_get_all() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        let values: Vec<_> = headers.get_all("Set-Cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn remove_returns_first_value() {
        let mut headers = HeaderMap::new();
        headers.append("Warning", "199 first");
        headers.append("Warning", "199 second");
        assert_eq!(headers.remove("warning").as_deref(), Some("199 first"));
        assert!(!headers.contains_key("Warning"));
    }

    #[test]
    fn token_matching() {
        assert!(value_has_token("Upgrade, close", "close"));
        assert!(value_has_token("Keep-Alive", "keep-alive"));
        assert!(!value_has_token("close-variant", "close"));
    }
}
