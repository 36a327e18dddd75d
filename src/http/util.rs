//! Request-target helpers and locally synthesized responses.
//!
//! Targets are parsed with `http::uri`: absolute-form as a [`Uri`], whose
//! scheme picks the default port, and authority-form (`CONNECT`, `Host`) as an
//! [`Authority`]. Hosts come back without IPv6 brackets.

use bytes::{BufMut, Bytes, BytesMut};
use http::uri::{Authority, Uri};

use crate::http::message::RequestHead;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Host and port named by an absolute or authority-form target, e.g.
/// `http://www.test.com:8080/test` gives `("www.test.com", 8080)`.
///
/// `default_port` applies to targets without a scheme; `http` and `https`
/// targets default to 80 and 443. Origin-form targets (`/path`) and `*` give
/// `None`.
pub fn target_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    if target.starts_with('/') || target == "*" {
        return None;
    }
    match target.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() => {
            let default_port = match uri.scheme_str() {
                Some(scheme) if scheme.eq_ignore_ascii_case("https") => DEFAULT_HTTPS_PORT,
                Some(scheme) if scheme.eq_ignore_ascii_case("http") => DEFAULT_HTTP_PORT,
                _ => default_port,
            };
            split_authority(uri.authority()?, default_port)
        }
        _ => {
            // Schemeless, possibly with a path: `host:port/test`.
            let end = target.find(['/', '?', '#']).unwrap_or(target.len());
            split_host_port(&target[..end], default_port)
        }
    }
}

/// Split an authority-form `host[:port]`, falling back to `default_port`.
/// A port that is present but not a number rejects the whole authority.
pub fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority: Authority = authority.parse().ok()?;
    split_authority(&authority, default_port)
}

fn split_authority(authority: &Authority, default_port: u16) -> Option<(String, u16)> {
    let host = authority.host();
    let host_port = authority.as_str().rsplit('@').next().unwrap_or_default();
    let rest = host_port.get(host.len()..)?;
    let port = if rest.is_empty() {
        default_port
    } else {
        rest.strip_prefix(':').and(authority.port_u16())?
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then(|| (host.to_string(), port))
}

/// Where a request asks to go, from its target or its `Host` header.
///
/// CONNECT targets default to port 443, `https` targets to 443, anything else to 80.
pub fn request_authority(request: &RequestHead) -> Option<(String, u16)> {
    if request.is_connect() {
        return split_host_port(&request.target, DEFAULT_HTTPS_PORT);
    }
    target_host_port(&request.target, DEFAULT_HTTP_PORT)
        .or_else(|| request.host_header().and_then(|h| split_host_port(h, DEFAULT_HTTP_PORT)))
}

/// Reduce an absolute-form target to origin form; other forms are returned as is.
/// The path and query are kept byte for byte.
pub fn origin_form(target: &str) -> String {
    match target.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() => {
            let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path)
            }
        }
        _ => target.to_string(),
    }
}

/// Value of the `Via` header this proxy adds.
pub fn via_value(alias: &str) -> String {
    format!("1.1 {}", alias)
}

/// Response written to the client once a direct CONNECT tunnel is open.
pub fn connect_established(via: &str) -> Bytes {
    fixed_response(
        "HTTP/1.1 200 Connection established",
        &[
            ("Connection", "Keep-Alive"),
            ("Proxy-Connection", "Keep-Alive"),
            ("Via", via),
        ],
    )
}

/// Response to a CONNECT that the proxy refuses to open.
pub fn proxy_error(via: &str) -> Bytes {
    fixed_response(
        "HTTP/1.1 502 Proxy Error",
        &[
            ("Connection", "close"),
            ("Proxy-Connection", "close"),
            ("Pragma", "no-cache"),
            ("Cache-Control", "no-cache"),
            ("Via", via),
        ],
    )
}

/// Response written in place of one the upstream never produced.
pub fn bad_gateway(via: &str) -> Bytes {
    fixed_response(
        "HTTP/1.1 502 Bad Gateway",
        &[
            ("Content-Length", "0"),
            ("Connection", "close"),
            ("Via", via),
        ],
    )
}

/// Response for a request whose body never reached the upstream in time.
/// The client connection stays open.
pub fn gateway_timeout(via: &str) -> Bytes {
    fixed_response("HTTP/1.1 504 Gateway Timeout", &[("Content-Length", "0"), ("Via", via)])
}

fn fixed_response(status_line: &str, headers: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(192);
    buf.put_slice(status_line.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, HOST};
    use http::Method;

    fn hp(host: &str, port: u16) -> Option<(String, u16)> {
        Some((host.to_string(), port))
    }

    #[test]
    fn parses_target_host_and_port() {
        assert_eq!(target_host_port("http://www.test.com:80/test", 80), hp("www.test.com", 80));
        assert_eq!(target_host_port("https://www.test.com:8443/test", 80), hp("www.test.com", 8443));
        assert_eq!(target_host_port("https://www.test.com/test", 80), hp("www.test.com", 443));
        assert_eq!(target_host_port("HTTPS://www.test.com/x", 80), hp("www.test.com", 443));
        assert_eq!(target_host_port("www.test.com:81/test", 80), hp("www.test.com", 81));
        assert_eq!(target_host_port("http://user:pw@www.test.com", 80), hp("www.test.com", 80));
        assert_eq!(target_host_port("www.test.com", 80), hp("www.test.com", 80));
        assert_eq!(target_host_port("http://[::1]:8080/x", 80), hp("::1", 8080));
        assert_eq!(target_host_port("/test", 80), None);
        assert_eq!(target_host_port("*", 80), None);
    }

    #[test]
    fn splits_ports() {
        assert_eq!(split_host_port("example.com", 80), hp("example.com", 80));
        assert_eq!(split_host_port("example.com:8443", 80), hp("example.com", 8443));
        assert_eq!(split_host_port("[::1]:9000", 80), hp("::1", 9000));
        assert_eq!(split_host_port("[::1]", 443), hp("::1", 443));
        assert_eq!(split_host_port("example.com:http", 80), None);
        assert_eq!(split_host_port("example.com:", 80), None);
        assert_eq!(split_host_port(":80", 80), None);
    }

    #[test]
    fn authority_defaults() {
        let connect = RequestHead::new(Method::CONNECT, "secure.example.com");
        assert_eq!(request_authority(&connect), Some(("secure.example.com".into(), 443)));

        let absolute = RequestHead::new(Method::GET, "http://example.com/a");
        assert_eq!(request_authority(&absolute), Some(("example.com".into(), 80)));

        let secure = RequestHead::new(Method::GET, "https://example.com/a");
        assert_eq!(request_authority(&secure), Some(("example.com".into(), 443)));

        let mut origin = RequestHead::new(Method::GET, "/a");
        assert_eq!(request_authority(&origin), None);
        origin.headers.insert(HOST, HeaderValue::from_static("example.com:8080"));
        assert_eq!(request_authority(&origin), Some(("example.com".into(), 8080)));
    }

    #[test]
    fn normalizes_to_origin_form() {
        assert_eq!(origin_form("http://localhost:1080/one?x=1"), "/one?x=1");
        assert_eq!(origin_form("http://localhost:1080"), "/");
        assert_eq!(origin_form("http://localhost:1080?x"), "/?x");
        assert_eq!(origin_form("/already"), "/already");
        assert_eq!(origin_form("http://h/a/../b%20c"), "/a/../b%20c");
    }

    #[test]
    fn connect_responses_are_well_formed() {
        let ok = connect_established("1.1 relay");
        assert!(ok.starts_with(b"HTTP/1.1 200 Connection established\r\n"));
        assert!(ok.ends_with(b"Via: 1.1 relay\r\n\r\n"));

        let err = proxy_error("1.1 relay");
        assert!(err.starts_with(b"HTTP/1.1 502 Proxy Error\r\n"));
        assert!(err.windows(17).any(|w| w == b"Connection: close"));

        let timeout = gateway_timeout("1.1 relay");
        assert!(timeout.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(!timeout.windows(10).any(|w| w == b"Connection"));
    }
}
