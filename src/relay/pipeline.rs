//! Upstream connection setup and response pipeline selection.
//!
//! # Responsibilities
//! - Open upstream sockets within the connect timeout
//! - Decide once per connection whether responses stream or get aggregated
//!   for a response filter
//! - Spawn the relay task that owns the socket

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::{HeaderMap, CONTENT_ENCODING};
use tokio::net::TcpStream;

use crate::cache::CacheManager;
use crate::error::ProxyError;
use crate::filter::{FullResponse, HttpFilter, RequestFilter, ResponseFilters};
use crate::http::codec::decode_chunked;
use crate::http::message::{is_chunked, set_content_length, BodyKind, RequestHead, ResponseHead};
use crate::net::connection::ConnectionId;
use crate::observability::ProxyStats;
use crate::relay::encoder::RequestEncoder;
use crate::relay::handler::{RelayHandler, RelayParts};
use crate::resilience::with_timeout;
use crate::routing::destination::Destination;
use crate::routing::resolver::Resolver;
use crate::upstream::{UpstreamHandle, UpstreamPool};

/// How responses on one upstream connection reach the client.
#[derive(Clone)]
pub enum ResponseMode {
    /// Forwarded event by event, untouched apart from `Via`.
    Stream,
    /// Decompressed, aggregated and passed through the filter.
    Aggregate(Arc<dyn HttpFilter>),
}

impl fmt::Debug for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMode::Stream => f.write_str("Stream"),
            ResponseMode::Aggregate(filter) => f.debug_tuple("Aggregate").field(filter).finish(),
        }
    }
}

/// Timeouts and identity used by every relay task.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    /// `Via` value, e.g. `1.1 relay-proxy`.
    pub via: String,
    pub transparent: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(40),
            idle_timeout: Duration::from_secs(70),
            write_timeout: Duration::from_secs(70),
            via: crate::http::util::via_value("relay-proxy"),
            transparent: false,
        }
    }
}

/// Builds upstream connections and their relay tasks.
#[derive(Debug, Clone)]
pub struct RelayPipeline {
    resolver: Resolver,
    request_filter: Option<Arc<dyn RequestFilter>>,
    response_filters: Option<Arc<dyn ResponseFilters>>,
    cache: Arc<dyn CacheManager>,
    pool: UpstreamPool,
    stats: ProxyStats,
    settings: PipelineSettings,
}

impl RelayPipeline {
    pub fn new(
        resolver: Resolver,
        cache: Arc<dyn CacheManager>,
        pool: UpstreamPool,
        stats: ProxyStats,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            resolver,
            request_filter: None,
            response_filters: None,
            cache,
            pool,
            stats,
            settings,
        }
    }

    pub fn with_request_filter(mut self, filter: Option<Arc<dyn RequestFilter>>) -> Self {
        self.request_filter = filter;
        self
    }

    pub fn with_response_filters(mut self, filters: Option<Arc<dyn ResponseFilters>>) -> Self {
        self.response_filters = filters;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Response handling for a connection to `key` opened for `request`.
    pub fn response_mode(&self, key: &str, request: &RequestHead) -> ResponseMode {
        match self.response_filters.as_ref().and_then(|f| f.filter_for(key)) {
            Some(filter) if filter.filter_responses(request) => ResponseMode::Aggregate(filter),
            _ => ResponseMode::Stream,
        }
    }

    /// Open a raw socket to `destination` within the connect timeout.
    pub async fn open_socket(&self, destination: &Destination) -> Result<TcpStream, ProxyError> {
        let connect = TcpStream::connect((destination.host(), destination.port()));
        let stream = match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProxyError::Connect {
                    key: destination.key(),
                    source,
                })
            }
            Err(_) => return Err(ProxyError::Timeout("connecting upstream")),
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Open a connection to `destination` and start its relay task.
    pub async fn connect(&self, destination: &Destination, request: &RequestHead) -> Result<UpstreamHandle, ProxyError> {
        let key = destination.key();
        let stream = self.open_socket(destination).await?;
        let id = ConnectionId::next();
        let mode = self.response_mode(&key, request);
        tracing::debug!(upstream_id = %id, key = %key, mode = ?mode, "Upstream connection established");

        let (handle, exchanges) = UpstreamHandle::new(id, &key);
        let encoder = RequestEncoder::new(self.resolver.clone(), &self.settings.via)
            .keep_proxy_format(destination.is_chained())
            .transparent(self.settings.transparent)
            .with_request_filter(self.request_filter.clone());

        let relay = RelayHandler::new(RelayParts {
            id,
            key,
            stream,
            handle: handle.clone(),
            exchanges,
            encoder,
            mode,
            pool: self.pool.clone(),
            cache: self.cache.clone(),
            guard: self.stats.track_upstream(id),
            stats: self.stats.clone(),
            via: self.settings.via.clone(),
            idle_timeout: self.settings.idle_timeout,
            write_timeout: self.settings.write_timeout,
        });
        tokio::spawn(relay.run());
        Ok(handle)
    }

    pub(crate) async fn write_timeout<T, E, F>(&self, what: &'static str, fut: F) -> Result<T, ProxyError>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: Into<ProxyError>,
    {
        with_timeout(self.settings.write_timeout, what, fut).await
    }
}

/// Collects one response for a [`HttpFilter`].
pub(crate) struct Aggregator {
    filter: Arc<dyn HttpFilter>,
    head: Option<ResponseHead>,
    raw: BytesMut,
    limit: usize,
}

impl Aggregator {
    pub(crate) fn new(filter: Arc<dyn HttpFilter>) -> Self {
        let limit = filter.max_response_size();
        Self {
            filter,
            head: None,
            raw: BytesMut::new(),
            limit,
        }
    }

    pub(crate) fn head(&mut self, head: ResponseHead) {
        self.head = Some(head);
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        if self.raw.len() + bytes.len() > self.limit {
            return Err(ProxyError::ResponseTooLarge(self.limit));
        }
        self.raw.extend_from_slice(bytes);
        Ok(())
    }

    /// Decode, filter and re-frame the collected response. Responses that
    /// carry no body (HEAD, 1xx, 204, 304) keep their framing headers.
    pub(crate) fn finish(self, request: &RequestHead) -> Result<FullResponse, ProxyError> {
        let mut head = self.head.ok_or(ProxyError::UpstreamClosed)?;
        let bodiless = matches!(head.body_kind(&request.method), BodyKind::None);
        let raw = self.raw.freeze();
        let body = if is_chunked(&head.headers) {
            decode_chunked(&raw)?
        } else {
            raw
        };
        let body = decompress(&mut head.headers, body, self.limit)?;

        let mut filtered = self.filter.filter_response(request, FullResponse { head, body });
        if bodiless {
            filtered.body = Bytes::new();
        } else {
            set_content_length(&mut filtered.head.headers, filtered.body.len());
        }
        Ok(filtered)
    }
}

/// Undo gzip/deflate content coding, keeping the decoded size under `limit`.
fn decompress(headers: &mut HeaderMap, body: Bytes, limit: usize) -> Result<Bytes, ProxyError> {
    if body.is_empty() {
        return Ok(body);
    }
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());
    let decoded = match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => read_limited(GzDecoder::new(&body[..]), limit, "gzip")?,
        Some("deflate") => read_limited(ZlibDecoder::new(&body[..]), limit, "deflate")?,
        _ => return Ok(body),
    };
    headers.remove(CONTENT_ENCODING);
    Ok(decoded)
}

fn read_limited(reader: impl Read, limit: usize, coding: &'static str) -> Result<Bytes, ProxyError> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| ProxyError::Decompress(coding))?;
    if out.len() > limit {
        return Err(ProxyError::ResponseTooLarge(limit));
    }
    Ok(Bytes::from(out))
}
