//! Where a request is sent.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::http::util::{split_host_port, DEFAULT_HTTP_PORT};

/// Protocol forced by a route, overriding the one implied by the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

/// Immutable description of an upstream target.
///
/// The pool keys connections on [`Destination::key`], so two destinations
/// with the same host and port share idle connections regardless of the
/// rewrite or context they carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
    protocol: Option<Protocol>,
    rewritten_target: Option<String>,
    context: Option<String>,
    chained: bool,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: None,
            rewritten_target: None,
            context: None,
            chained: false,
        }
    }

    /// Parse `host[:port]`, defaulting to port 80.
    pub fn parse(host_and_port: &str) -> Option<Self> {
        split_host_port(host_and_port.trim(), DEFAULT_HTTP_PORT).map(|(host, port)| Self::new(host, port))
    }

    /// Replace the request target with `target` when the request is encoded.
    pub fn with_rewrite(mut self, target: impl Into<String>) -> Self {
        self.rewritten_target = Some(target.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Attach an opaque routing context (a route name, for instance).
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Mark this destination as another proxy rather than an origin server.
    pub fn chained(mut self) -> Self {
        self.chained = true;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn rewritten_target(&self) -> Option<&str> {
        self.rewritten_target.as_deref()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn is_chained(&self) -> bool {
        self.chained
    }

    /// `host:port` key used by the connection pool and filter registry.
    pub fn key(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())?;
        if let Some(target) = &self.rewritten_target {
            write!(f, " ({})", target)?;
        }
        if self.chained {
            write!(f, " [chained]")?;
        }
        Ok(())
    }
}
