//! Error type shared by the relay engine.

use crate::http::CodecError;
use crate::net::ListenerError;

/// Errors raised while resolving, connecting or relaying a request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no route for request target {0}")]
    NoRoute(String),

    #[error("failed to connect to {key}: {source}")]
    Connect {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("CONNECT to port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("upstream refused the tunnel with status {0}")]
    TunnelRefused(u16),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("response body exceeded {0} bytes")]
    ResponseTooLarge(usize),

    #[error("could not decode {0} response body")]
    Decompress(&'static str),

    #[error("upstream closed the connection before the response completed")]
    UpstreamClosed,

    #[error("request body was abandoned before it was complete")]
    BodyAborted,

    #[error("client connection went away")]
    ClientGone,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
