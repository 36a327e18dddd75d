//! Declarative route table and its hot-swappable store.
//!
//! # Design Decisions
//! - A table is immutable once built; reloads build a new one
//! - `RouteTableStore` swaps whole tables through `arc-swap`, so a lookup
//!   sees either the old table or the new one, never a mix

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::RouteConfig;
use crate::http::message::RequestHead;
use crate::routing::destination::Destination;
use crate::routing::matcher::{request_host, request_path, HostMatcher, PathMatcher};

/// One entry of the table.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: Option<String>,
    pub host: Option<HostMatcher>,
    pub path: PathMatcher,
    pub destination: Destination,
}

/// Ordered routes, most specific first.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for the common exact-path case.
    pub fn insert(&mut self, path: impl Into<String>, destination: Destination) {
        self.push(Route {
            name: None,
            host: None,
            path: PathMatcher::Exact(path.into()),
            destination,
        });
    }

    pub fn push(&mut self, route: Route) {
        self.routes.push(route);
        // Stable sort keeps configuration order among equally specific routes.
        self.routes.sort_by(|a, b| {
            let a_key = (a.host.is_some(), a.path.specificity());
            let b_key = (b.host.is_some(), b.path.specificity());
            b_key.cmp(&a_key)
        });
    }

    /// Build a table from `[[routes]]` entries. Entries whose target does not
    /// parse are skipped; validation reports them before this point.
    pub fn from_config(routes: &[RouteConfig]) -> Self {
        let mut table = Self::new();
        for route in routes {
            let Some(mut destination) = Destination::parse(&route.target) else {
                tracing::warn!(target = %route.target, "Skipping route with unparsable target");
                continue;
            };
            if let Some(rewrite) = &route.rewrite {
                destination = destination.with_rewrite(rewrite.clone());
            }
            if let Some(protocol) = route.protocol {
                destination = destination.with_protocol(protocol);
            }
            if let Some(name) = &route.name {
                destination = destination.with_context(name.clone());
            }
            let path = match (&route.path, &route.path_prefix) {
                (Some(path), _) => PathMatcher::Exact(path.clone()),
                (None, Some(prefix)) => PathMatcher::Prefix(prefix.clone()),
                (None, None) => PathMatcher::Prefix("/".to_string()),
            };
            table.push(Route {
                name: route.name.clone(),
                host: route.match_host.as_deref().map(HostMatcher::new),
                path,
                destination,
            });
        }
        table
    }

    /// First matching route's destination.
    pub fn lookup(&self, host: Option<&str>, path: &str) -> Option<&Destination> {
        self.routes
            .iter()
            .find(|r| r.host.as_ref().map_or(true, |m| m.matches(host)) && r.path.matches(path))
            .map(|r| &r.destination)
    }

    /// Look up a request; `None` when nothing matches or the target is malformed.
    pub fn lookup_request(&self, request: &RequestHead) -> Option<&Destination> {
        let path = request_path(request)?;
        let host = request_host(request);
        self.lookup(host.as_deref(), &path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Shared handle to the live route table.
#[derive(Debug, Clone)]
pub struct RouteTableStore {
    inner: Arc<ArcSwap<RouteTable>>,
}

impl RouteTableStore {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.inner.load_full()
    }

    /// Atomically replace the whole table.
    pub fn replace(&self, table: RouteTable) {
        let count = table.len();
        self.inner.store(Arc::new(table));
        tracing::info!(routes = count, "Route table replaced");
    }
}

impl Default for RouteTableStore {
    fn default() -> Self {
        Self::new(RouteTable::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_routes_win_over_prefixes() {
        let mut table = RouteTable::new();
        table.push(Route {
            name: None,
            host: None,
            path: PathMatcher::Prefix("/".into()),
            destination: Destination::new("fallback", 80),
        });
        table.insert("/1", Destination::new("localhost", 1080).with_rewrite("/one"));
        table.insert("/2", Destination::new("localhost", 1081).with_rewrite("/two"));

        assert_eq!(table.lookup(None, "/1").unwrap().key(), "localhost:1080");
        assert_eq!(table.lookup(None, "/2").unwrap().rewritten_target(), Some("/two"));
        assert_eq!(table.lookup(None, "/3").unwrap().host(), "fallback");
    }

    #[test]
    fn host_restricted_routes() {
        let mut table = RouteTable::new();
        table.push(Route {
            name: Some("api".into()),
            host: Some(HostMatcher::new("api.example.com")),
            path: PathMatcher::Prefix("/".into()),
            destination: Destination::new("10.0.0.1", 8080),
        });
        assert!(table.lookup(Some("www.example.com"), "/x").is_none());
        assert!(table.lookup(Some("api.example.com"), "/x").is_some());
    }

    #[test]
    fn store_swaps_whole_table() {
        let store = RouteTableStore::default();
        let before = store.load();
        assert!(before.is_empty());

        let mut table = RouteTable::new();
        table.insert("/1", Destination::new("localhost", 1080));
        store.replace(table);

        assert!(before.is_empty());
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn builds_from_config() {
        let routes = vec![
            RouteConfig {
                name: Some("one".into()),
                path: Some("/1".into()),
                target: "localhost:1080".into(),
                rewrite: Some("/one".into()),
                ..RouteConfig::default()
            },
            RouteConfig {
                path: Some("/bad".into()),
                target: "".into(),
                ..RouteConfig::default()
            },
        ];
        let table = RouteTable::from_config(&routes);
        assert_eq!(table.len(), 1);
        let dest = table.lookup(None, "/1").unwrap();
        assert_eq!(dest.context(), Some("one"));
        assert_eq!(dest.rewritten_target(), Some("/one"));
    }
}
