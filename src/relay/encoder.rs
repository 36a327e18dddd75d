//! Outgoing request encoding.
//!
//! Steps, in order:
//! 1. tell the relay about the original request (hop-by-hop headers intact)
//! 2. copy it and normalize proxy framing
//! 3. apply the request filter
//! 4. apply the destination rewrite
//! 5. add `Via` (unless transparent)
//! 6. serialize

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, PROXY_AUTHORIZATION, VIA};

use crate::filter::RequestFilter;
use crate::http::message::{RequestHead, PROXY_CONNECTION};
use crate::http::util::origin_form;
use crate::routing::destination::Destination;
use crate::routing::resolver::Resolver;

/// Receives the original request before it is transformed.
pub trait EncodeListener {
    fn request_encoded(&mut self, seq: u64, original: &RequestHead);
}

#[derive(Debug, Clone)]
pub struct RequestEncoder {
    /// Keep absolute-form targets and proxy credentials (talking to another proxy).
    keep_proxy_format: bool,
    transparent: bool,
    via: Option<HeaderValue>,
    request_filter: Option<Arc<dyn RequestFilter>>,
    resolver: Resolver,
}

impl RequestEncoder {
    pub fn new(resolver: Resolver, via: &str) -> Self {
        Self {
            keep_proxy_format: false,
            transparent: false,
            via: HeaderValue::from_str(via).ok(),
            request_filter: None,
            resolver,
        }
    }

    pub fn keep_proxy_format(mut self, keep: bool) -> Self {
        self.keep_proxy_format = keep;
        self
    }

    pub fn transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    pub fn with_request_filter(mut self, filter: Option<Arc<dyn RequestFilter>>) -> Self {
        self.request_filter = filter;
        self
    }

    pub fn encode(
        &self,
        seq: u64,
        original: &RequestHead,
        destination: &Destination,
        listener: &mut impl EncodeListener,
    ) -> Bytes {
        listener.request_encoded(seq, original);

        let mut to_send = if self.transparent {
            original.clone()
        } else {
            self.copy_request(original)
        };

        if let Some(filter) = &self.request_filter {
            filter.filter(&mut to_send);
        }
        self.resolver.rewrite(&mut to_send, destination);

        if !self.transparent {
            if let Some(via) = &self.via {
                to_send.headers.append(VIA, via.clone());
            }
        }
        to_send.encode()
    }

    fn copy_request(&self, original: &RequestHead) -> RequestHead {
        let mut copy = original.clone();
        copy.headers.remove(PROXY_CONNECTION);
        if !self.keep_proxy_format {
            copy.target = origin_form(&copy.target);
            copy.headers.remove(PROXY_AUTHORIZATION);
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::router::StaticRouter;
    use http::Method;

    #[derive(Default)]
    struct Recorder(Vec<(u64, String)>);

    impl EncodeListener for Recorder {
        fn request_encoded(&mut self, seq: u64, original: &RequestHead) {
            self.0.push((seq, original.target.clone()));
        }
    }

    fn proxied_request() -> RequestHead {
        let mut request = RequestHead::new(Method::GET, "http://localhost:1080/1");
        request.headers.insert("host", HeaderValue::from_static("localhost:1080"));
        request.headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        request.headers.insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        request
    }

    fn text(bytes: &Bytes) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn normalizes_for_origin_servers() {
        let encoder = RequestEncoder::new(Resolver::new(), "1.1 relay");
        let mut recorder = Recorder::default();
        let wire = text(&encoder.encode(0, &proxied_request(), &Destination::new("localhost", 1080), &mut recorder));

        assert!(wire.starts_with("GET /1 HTTP/1.1\r\n"));
        assert!(!wire.contains("proxy-connection"));
        assert!(!wire.contains("proxy-authorization"));
        assert!(wire.contains("via: 1.1 relay\r\n"));
        assert_eq!(recorder.0, vec![(0, "http://localhost:1080/1".to_string())]);
    }

    #[test]
    fn keeps_proxy_format_when_chained() {
        let encoder = RequestEncoder::new(Resolver::new(), "1.1 relay").keep_proxy_format(true);
        let destination = Destination::new("upstream", 3128).chained();
        let wire = text(&encoder.encode(3, &proxied_request(), &destination, &mut Recorder::default()));

        assert!(wire.starts_with("GET http://localhost:1080/1 HTTP/1.1\r\n"));
        assert!(wire.contains("proxy-authorization: Basic abc"));
        assert!(!wire.contains("proxy-connection"));
    }

    #[test]
    fn applies_router_rewrite() {
        let destination = Destination::new("localhost", 1080).with_rewrite("/one");
        let resolver = Resolver::new().with_router(Arc::new(StaticRouter::new(destination.clone())));
        let encoder = RequestEncoder::new(resolver, "1.1 relay");
        let wire = text(&encoder.encode(0, &proxied_request(), &destination, &mut Recorder::default()));
        assert!(wire.starts_with("GET /one HTTP/1.1\r\n"));
    }

    #[test]
    fn transparent_sends_request_untouched() {
        let encoder = RequestEncoder::new(Resolver::new(), "1.1 relay").transparent(true);
        let wire = text(&encoder.encode(0, &proxied_request(), &Destination::new("localhost", 1080), &mut Recorder::default()));
        assert!(wire.starts_with("GET http://localhost:1080/1 HTTP/1.1\r\n"));
        assert!(!wire.contains("via:"));
    }
}
