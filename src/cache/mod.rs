//! Response cache collaborator.
//!
//! The relay engine consults the cache before dispatching a request and
//! offers it every aggregated response. Storage policy lives entirely
//! behind the trait.

use std::fmt::Debug;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::http::message::{RequestHead, ResponseHead};
use crate::proxy::writer::ClientResponder;

pub trait CacheManager: Send + Sync + Debug {
    /// Answer `request` from the cache through `responder`. Returns true if it did.
    fn try_serve(&self, request: &RequestHead, responder: &ClientResponder) -> bool;

    /// Offer a complete response; an implementation may store it in the background.
    fn store(&self, request: &RequestHead, response: &ResponseHead, body: &Bytes) -> Option<JoinHandle<()>>;
}

/// Cache that never serves and never stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CacheManager for NoCache {
    fn try_serve(&self, _request: &RequestHead, _responder: &ClientResponder) -> bool {
        false
    }

    fn store(&self, _request: &RequestHead, _response: &ResponseHead, _body: &Bytes) -> Option<JoinHandle<()>> {
        None
    }
}
