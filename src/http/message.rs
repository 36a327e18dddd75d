//! Parsed HTTP/1.x message heads.
//!
//! # Responsibilities
//! - Hold the request line / status line and headers of one message
//! - Derive body framing (Content-Length, chunked, close-delimited)
//! - Derive persistence intent from version and `Connection` tokens
//! - Serialize a head back to wire bytes

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

/// Non-standard header still sent by HTTP/1.0 era clients talking to a proxy.
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// How the body that follows a message head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body at all.
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the peer closes the connection (responses only).
    CloseDelimited,
}

impl BodyKind {
    pub fn has_body(&self) -> bool {
        !matches!(self, BodyKind::None | BodyKind::Length(0))
    }
}

/// Head of a client request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as received (origin, absolute or authority form).
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn body_kind(&self) -> BodyKind {
        if is_chunked(&self.headers) {
            return BodyKind::Chunked;
        }
        match content_length(&self.headers) {
            Ok(Some(len)) => BodyKind::Length(len),
            _ => BodyKind::None,
        }
    }

    /// Whether the client intends to keep its connection open after this exchange.
    ///
    /// Both `Connection` and `Proxy-Connection` are honoured.
    pub fn wants_keep_alive(&self) -> bool {
        if has_token(&self.headers, &PROXY_CONNECTION, "close") {
            return false;
        }
        if self.version == Version::HTTP_10 && has_token(&self.headers, &PROXY_CONNECTION, "keep-alive") {
            return true;
        }
        keep_alive(self.version, &self.headers)
    }

    pub fn host_header(&self) -> Option<&str> {
        self.headers.get(header::HOST).and_then(|v| v.to_str().ok())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.target.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(version_str(self.version).as_bytes());
        buf.put_slice(b"\r\n");
        write_headers(&mut buf, &self.headers);
        buf.freeze()
    }
}

/// Head of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as received; empty means "use the canonical one".
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: String::new(),
            headers: HeaderMap::new(),
        }
    }

    /// `1xx` responses other than `101` precede the real response.
    pub fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }

    /// Body framing of this response given the method of the request it answers.
    pub fn body_kind(&self, request_method: &Method) -> BodyKind {
        if *request_method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
            || (*request_method == Method::CONNECT && self.status.is_success())
        {
            return BodyKind::None;
        }
        if is_chunked(&self.headers) {
            return BodyKind::Chunked;
        }
        match content_length(&self.headers) {
            Ok(Some(len)) => BodyKind::Length(len),
            _ => BodyKind::CloseDelimited,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(version_str(self.version).as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.as_str().as_bytes());
        buf.put_u8(b' ');
        let reason = if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            self.reason.as_str()
        };
        buf.put_slice(reason.as_bytes());
        buf.put_slice(b"\r\n");
        write_headers(&mut buf, &self.headers);
        buf.freeze()
    }
}

/// Persistence per HTTP/1.x rules: 1.1 persists unless `close`, 1.0 only with `keep-alive`.
pub fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if has_token(headers, &header::CONNECTION, "close") {
        return false;
    }
    match version {
        Version::HTTP_10 => has_token(headers, &header::CONNECTION, "keep-alive"),
        Version::HTTP_09 => false,
        _ => true,
    }
}

/// Case-insensitive search for `token` in the comma separated values of `name`.
pub fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Declared Content-Length; repeated headers must agree.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    let mut found = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed: u64 = value
            .to_str()
            .map_err(|_| ())?
            .trim()
            .parse()
            .map_err(|_| ())?;
        match found {
            Some(previous) if previous != parsed => return Err(()),
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_09 => "HTTP/0.9",
        _ => "HTTP/1.1",
    }
}

fn write_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Replace any `Content-Length` / `Transfer-Encoding` with a fixed length.
pub fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: Version, headers: &[(&'static str, &'static str)]) -> RequestHead {
        let mut head = RequestHead::new(Method::GET, "/");
        head.version = version;
        for (name, value) in headers {
            head.headers.append(*name, HeaderValue::from_static(value));
        }
        head
    }

    #[test]
    fn http11_persists_by_default() {
        assert!(request(Version::HTTP_11, &[]).wants_keep_alive());
        assert!(!request(Version::HTTP_11, &[("connection", "close")]).wants_keep_alive());
    }

    #[test]
    fn http10_needs_explicit_keep_alive() {
        assert!(!request(Version::HTTP_10, &[]).wants_keep_alive());
        assert!(request(Version::HTTP_10, &[("connection", "Keep-Alive")]).wants_keep_alive());
        assert!(request(Version::HTTP_10, &[("proxy-connection", "keep-alive")]).wants_keep_alive());
    }

    #[test]
    fn response_body_kinds() {
        let mut head = ResponseHead::new(StatusCode::OK);
        assert_eq!(head.body_kind(&Method::GET), BodyKind::CloseDelimited);
        assert_eq!(head.body_kind(&Method::HEAD), BodyKind::None);

        head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert_eq!(head.body_kind(&Method::GET), BodyKind::Length(12));

        head.headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));
        assert_eq!(head.body_kind(&Method::GET), BodyKind::Chunked);

        let not_modified = ResponseHead::new(StatusCode::NOT_MODIFIED);
        assert_eq!(not_modified.body_kind(&Method::GET), BodyKind::None);
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("4"));
        assert!(content_length(&headers).is_err());
    }

    #[test]
    fn encodes_status_line_with_canonical_reason() {
        let mut head = ResponseHead::new(StatusCode::BAD_GATEWAY);
        set_content_length(&mut head.headers, 0);
        let wire = head.encode();
        assert_eq!(&wire[..], b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n");
    }
}
