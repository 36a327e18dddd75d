//! Request and response filters.
//!
//! # Data Flow
//! ```text
//! outgoing request copy
//!     → RequestFilter::filter (mutate head)
//!
//! new upstream connection
//!     → ResponseFilters::filter_for("host:port")
//!     → HttpFilter::filter_responses(request)?
//!         yes → responses decompressed, aggregated up to max_response_size,
//!               passed to filter_response, re-framed with Content-Length
//!         no  → responses streamed untouched
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::http::message::{RequestHead, ResponseHead};

/// Default bound for aggregated response bodies.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 200 * 1024;

/// Mutates outgoing requests.
pub trait RequestFilter: Send + Sync + Debug {
    fn filter(&self, request: &mut RequestHead);
}

/// A response with its complete, decoded body.
#[derive(Debug, Clone)]
pub struct FullResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// Inspects or rewrites whole responses.
pub trait HttpFilter: Send + Sync + Debug {
    /// Whether responses on a connection opened for `request` go through this filter.
    fn filter_responses(&self, request: &RequestHead) -> bool;

    fn filter_response(&self, request: &RequestHead, response: FullResponse) -> FullResponse;

    fn max_response_size(&self) -> usize {
        DEFAULT_MAX_RESPONSE_SIZE
    }
}

/// Looks up the response filter for a destination.
pub trait ResponseFilters: Send + Sync + Debug {
    fn filter_for(&self, host_and_port: &str) -> Option<Arc<dyn HttpFilter>>;
}

/// Response filters keyed by `host:port`.
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn HttpFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, host_and_port: impl Into<String>, filter: Arc<dyn HttpFilter>) -> Self {
        self.filters.insert(host_and_port.into(), filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl ResponseFilters for FilterRegistry {
    fn filter_for(&self, host_and_port: &str) -> Option<Arc<dyn HttpFilter>> {
        self.filters.get(host_and_port).cloned()
    }
}

/// Adds fixed headers to every outgoing request.
#[derive(Debug, Clone, Default)]
pub struct HeaderInjector {
    headers: http::HeaderMap,
}

impl HeaderInjector {
    pub fn new(headers: http::HeaderMap) -> Self {
        Self { headers }
    }
}

impl RequestFilter for HeaderInjector {
    fn filter(&self, request: &mut RequestHead) {
        for (name, value) in &self.headers {
            request.headers.insert(name.clone(), value.clone());
        }
    }
}
