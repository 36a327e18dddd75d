//! Proxy authorization.

use std::fmt::Debug;

use bytes::Bytes;
use http::header::PROXY_AUTHORIZATION;

use crate::http::message::RequestHead;
use crate::proxy::writer::ClientResponder;

/// Decides whether a client request may use the proxy.
pub trait ProxyAuthorization: Send + Sync + Debug {
    /// On rejection the implementation sets the response on `responder`
    /// and returns false.
    fn authorize(&self, request: &RequestHead, responder: &ClientResponder) -> bool;
}

const PROXY_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
Proxy-Authenticate: Basic realm=\"relay-proxy\"\r\n\
Content-Length: 0\r\n\
\r\n";

/// Accepts requests whose `Proxy-Authorization` equals one configured value,
/// e.g. `Basic dXNlcjpwYXNz`.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    expected: String,
}

impl StaticCredentials {
    pub fn new(expected: impl Into<String>) -> Self {
        Self { expected: expected.into() }
    }
}

impl ProxyAuthorization for StaticCredentials {
    fn authorize(&self, request: &RequestHead, responder: &ClientResponder) -> bool {
        let presented = request
            .headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);
        if presented == Some(self.expected.as_str()) {
            return true;
        }
        tracing::info!(method = %request.method, target = %request.target, "Proxy authorization rejected");
        responder.respond(Bytes::from_static(PROXY_AUTH_REQUIRED));
        false
    }
}
