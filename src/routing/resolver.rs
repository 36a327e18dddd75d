//! Destination resolution.
//!
//! First match wins:
//! 1. chained upstream proxy picked by the selector
//! 2. the configured router
//! 3. `host:port` taken from the request target or `Host` header
//! 4. the configured default destination

use std::sync::Arc;

use crate::error::ProxyError;
use crate::http::message::RequestHead;
use crate::http::util::request_authority;
use crate::routing::chain::ChainProxySelector;
use crate::routing::destination::Destination;
use crate::routing::router::{apply_rewrite, ChainRouter, RequestRouter};

/// Pure lookup from request to destination.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    chain: Option<ChainRouter>,
    router: Option<Arc<dyn RequestRouter>>,
    default: Option<Destination>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, selector: Arc<dyn ChainProxySelector>) -> Self {
        self.chain = Some(ChainRouter::new(selector));
        self
    }

    pub fn with_router(mut self, router: Arc<dyn RequestRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_default(mut self, default: Destination) -> Self {
        self.default = Some(default);
        self
    }

    pub fn chain_selector(&self) -> Option<&Arc<dyn ChainProxySelector>> {
        self.chain.as_ref().map(ChainRouter::selector)
    }

    pub fn resolve(&self, request: &RequestHead) -> Result<Destination, ProxyError> {
        if let Some(destination) = self.chain.as_ref().and_then(|c| c.resolve(request)) {
            return Ok(destination);
        }
        if let Some(destination) = self.router.as_ref().and_then(|r| r.resolve(request)) {
            return Ok(destination);
        }
        if let Some((host, port)) = request_authority(request) {
            return Ok(Destination::new(host, port));
        }
        self.default
            .clone()
            .ok_or_else(|| ProxyError::NoRoute(request.target.clone()))
    }

    /// Apply the configured router's rewrite to an outgoing request copy.
    pub fn rewrite(&self, request: &mut RequestHead, destination: &Destination) {
        match &self.router {
            Some(router) if !destination.is_chained() => router.rewrite(request, destination),
            _ => apply_rewrite(request, destination),
        }
    }
}
