//! Pluggable request routers.
//!
//! # Responsibilities
//! - Map a request to a [`Destination`]
//! - Rewrite the outgoing request for that destination
//!
//! # Design Decisions
//! - One trait, three variants: a fixed destination, the route table, and
//!   chained-proxy selection
//! - `rewrite` has a default that applies the destination's rewritten target,
//!   which is all the built-in routers need

use std::fmt::Debug;
use std::sync::Arc;

use crate::http::message::RequestHead;
use crate::routing::chain::ChainProxySelector;
use crate::routing::destination::Destination;
use crate::routing::table::RouteTableStore;

/// Resolves and rewrites requests.
pub trait RequestRouter: Send + Sync + Debug {
    /// Destination for this request, or `None` to let the resolver fall back.
    fn resolve(&self, request: &RequestHead) -> Option<Destination>;

    /// Adjust the copy of the request about to be sent to `destination`.
    fn rewrite(&self, request: &mut RequestHead, destination: &Destination) {
        apply_rewrite(request, destination);
    }
}

/// Replace the request target with the destination's rewritten target, if any.
pub fn apply_rewrite(request: &mut RequestHead, destination: &Destination) {
    if let Some(target) = destination.rewritten_target() {
        request.target = target.to_string();
    }
}

/// Sends every request to the same destination.
#[derive(Debug, Clone)]
pub struct StaticRouter {
    destination: Destination,
}

impl StaticRouter {
    pub fn new(destination: Destination) -> Self {
        Self { destination }
    }
}

impl RequestRouter for StaticRouter {
    fn resolve(&self, _request: &RequestHead) -> Option<Destination> {
        Some(self.destination.clone())
    }
}

/// Routes through the live route table. Requests no route matches are left
/// to the resolver's default.
#[derive(Debug, Clone)]
pub struct TableRouter {
    table: RouteTableStore,
}

impl TableRouter {
    pub fn new(table: RouteTableStore) -> Self {
        Self { table }
    }
}

impl RequestRouter for TableRouter {
    fn resolve(&self, request: &RequestHead) -> Option<Destination> {
        let table = self.table.load();
        match table.lookup_request(request) {
            Some(destination) => Some(destination.clone()),
            None => {
                tracing::trace!(target = %request.target, "No route matched");
                None
            }
        }
    }
}

/// Sends requests through whichever upstream proxy the selector picks.
#[derive(Debug, Clone)]
pub struct ChainRouter {
    selector: Arc<dyn ChainProxySelector>,
}

impl ChainRouter {
    pub fn new(selector: Arc<dyn ChainProxySelector>) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &Arc<dyn ChainProxySelector> {
        &self.selector
    }
}

impl RequestRouter for ChainRouter {
    fn resolve(&self, request: &RequestHead) -> Option<Destination> {
        let upstream = self.selector.select_upstream(request)?;
        if upstream.trim().is_empty() {
            return None;
        }
        Destination::parse(&upstream).map(Destination::chained)
    }
}
