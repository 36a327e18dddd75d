//! Route matching conditions.
//!
//! # Responsibilities
//! - Match the request host (exact, case-insensitive)
//! - Match the request path exactly or by prefix (case-sensitive)
//!
//! # Design Decisions
//! - The host comes from the absolute target when present, else from `Host`
//! - The path is taken after `url` parsing, so `http://h/one` and `/one` match alike
//! - No regex, matching stays O(route count)

use std::fmt;

use url::Url;

use crate::http::message::RequestHead;
use crate::http::util::{split_host_port, target_host_port, DEFAULT_HTTP_PORT};

/// Request path as seen by routes, or `None` when the target does not parse.
pub fn request_path(request: &RequestHead) -> Option<String> {
    let url = if request.target.contains("://") {
        Url::parse(&request.target).ok()?
    } else {
        Url::parse("http://localhost").ok()?.join(&request.target).ok()?
    };
    Some(url.path().to_string())
}

/// Host the request is addressed to, lower-cased and without a port.
pub fn request_host(request: &RequestHead) -> Option<String> {
    target_host_port(&request.target, DEFAULT_HTTP_PORT)
        .or_else(|| split_host_port(request.host_header()?, DEFAULT_HTTP_PORT))
        .map(|(host, _)| host.to_ascii_lowercase())
}

/// Matches the host a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_ascii_lowercase(),
        }
    }

    pub fn matches(&self, host: Option<&str>) -> bool {
        host == Some(self.expected_host.as_str())
    }
}

impl fmt::Display for HostMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expected_host)
    }
}

/// Matches the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => path == expected,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    /// Longer patterns are more specific; exact beats any prefix.
    pub fn specificity(&self) -> (bool, usize) {
        match self {
            PathMatcher::Exact(p) => (true, p.len()),
            PathMatcher::Prefix(p) => (false, p.len()),
        }
    }
}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMatcher::Exact(p) => f.write_str(p),
            PathMatcher::Prefix(p) => write!(f, "{}*", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, HOST};
    use http::Method;

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("Example.com");
        let mut req = RequestHead::new(Method::GET, "/");
        req.headers.insert(HOST, HeaderValue::from_static("EXAMPLE.COM:8080"));
        assert!(matcher.matches(request_host(&req).as_deref()));

        let absolute = RequestHead::new(Method::GET, "http://other.com/x");
        assert!(!matcher.matches(request_host(&absolute).as_deref()));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathMatcher::Prefix("/api".into());
        assert!(matcher.matches("/api/v1"));
        assert!(!matcher.matches("/images"));
        assert!(PathMatcher::Exact("/1".into()).matches("/1"));
        assert!(!PathMatcher::Exact("/1".into()).matches("/10"));
    }

    #[test]
    fn path_ignores_target_form() {
        let absolute = RequestHead::new(Method::GET, "http://localhost:8080/1?q=2");
        let origin = RequestHead::new(Method::GET, "/1?q=2");
        assert_eq!(request_path(&absolute).as_deref(), Some("/1"));
        assert_eq!(request_path(&origin).as_deref(), Some("/1"));
        assert_eq!(request_path(&RequestHead::new(Method::GET, "http://[bad")), None);
    }
}
