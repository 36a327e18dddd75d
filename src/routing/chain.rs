//! Chained upstream proxy selection.
//!
//! # Responsibilities
//! - Pick the upstream proxy a request should be sent through
//! - Remember which upstream proxies failed so failover picks another one

use std::fmt::Debug;

use dashmap::DashSet;

use crate::http::message::RequestHead;

/// Chooses an upstream proxy for a request.
pub trait ChainProxySelector: Send + Sync + Debug {
    /// `host:port` of the upstream proxy, or `None` to connect directly.
    fn select_upstream(&self, request: &RequestHead) -> Option<String>;

    /// Called when connecting to `host_and_port` failed.
    fn on_connection_error(&self, host_and_port: &str);
}

/// Fixed list of upstream proxies. The first one not marked failed wins;
/// once every entry has failed the marks are cleared and the list starts over.
#[derive(Debug, Default)]
pub struct StaticChainSelector {
    upstreams: Vec<String>,
    failed: DashSet<String>,
}

impl StaticChainSelector {
    pub fn new<I, S>(upstreams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            upstreams: upstreams.into_iter().map(Into::into).collect(),
            failed: DashSet::new(),
        }
    }
}

impl ChainProxySelector for StaticChainSelector {
    fn select_upstream(&self, _request: &RequestHead) -> Option<String> {
        if let Some(healthy) = self.upstreams.iter().find(|u| !self.failed.contains(u.as_str())) {
            return Some(healthy.clone());
        }
        self.failed.clear();
        self.upstreams.first().cloned()
    }

    fn on_connection_error(&self, host_and_port: &str) {
        if self.upstreams.iter().any(|u| u == host_and_port) {
            tracing::warn!(upstream = %host_and_port, "Marking chained proxy as failed");
            self.failed.insert(host_and_port.to_string());
        }
    }
}
