//! Proxy server setup and accept loop.
//!
//! # Responsibilities
//! - Assemble the shared relay engine from `ProxyConfig` and collaborators
//! - Accept client connections (optionally terminating TLS)
//! - Spawn one client handler per connection
//! - Stop accepting on the shutdown signal

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::cache::{CacheManager, NoCache};
use crate::config::schema::ConnectConfig;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::filter::{RequestFilter, ResponseFilters};
use crate::http::util::via_value;
use crate::net::connection::ConnectionId;
use crate::net::listener::Listener;
use crate::net::tls::load_tls_acceptor;
use crate::net::ListenerError;
use crate::observability::ProxyStats;
use crate::proxy::handler::ClientRequestHandler;
use crate::relay::pipeline::PipelineSettings;
use crate::relay::RelayPipeline;
use crate::routing::chain::{ChainProxySelector, StaticChainSelector};
use crate::routing::destination::Destination;
use crate::routing::resolver::Resolver;
use crate::routing::router::{RequestRouter, TableRouter};
use crate::routing::table::{RouteTable, RouteTableStore};
use crate::security::{ProxyAuthorization, StaticCredentials};
use crate::upstream::UpstreamPool;

/// Everything a client handler shares with the rest of the proxy.
#[derive(Debug)]
pub(crate) struct ProxyContext {
    pub(crate) resolver: Resolver,
    pub(crate) pool: UpstreamPool,
    pub(crate) pipeline: RelayPipeline,
    pub(crate) authorization: Option<Arc<dyn ProxyAuthorization>>,
    pub(crate) cache: Arc<dyn CacheManager>,
    pub(crate) connect: ConnectConfig,
    pub(crate) chunk_wait: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) max_failover_attempts: u32,
    pub(crate) via: String,
    pub(crate) stats: ProxyStats,
}

/// Intercepting HTTP/HTTPS proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    routes: RouteTableStore,
    pool: UpstreamPool,
    stats: ProxyStats,
    router: Option<Arc<dyn RequestRouter>>,
    chain: Option<Arc<dyn ChainProxySelector>>,
    authorization: Option<Arc<dyn ProxyAuthorization>>,
    cache: Arc<dyn CacheManager>,
    request_filter: Option<Arc<dyn RequestFilter>>,
    response_filters: Option<Arc<dyn ResponseFilters>>,
}

impl ProxyServer {
    /// Build a server from configuration, with collaborators derived from it:
    /// the route table, a static chain selector and static credentials.
    pub fn new(config: ProxyConfig) -> Self {
        let routes = RouteTableStore::new(RouteTable::from_config(&config.routes));
        let chain = (!config.chain.upstreams.is_empty()).then(|| {
            Arc::new(StaticChainSelector::new(config.chain.upstreams.iter().cloned())) as Arc<dyn ChainProxySelector>
        });
        let authorization = config
            .proxy
            .proxy_authorization
            .as_ref()
            .map(|expected| Arc::new(StaticCredentials::new(expected.clone())) as Arc<dyn ProxyAuthorization>);

        Self {
            pool: UpstreamPool::new(config.pool.max_idle_per_host),
            config,
            routes,
            stats: ProxyStats::new(),
            router: None,
            chain,
            authorization,
            cache: Arc::new(NoCache),
            request_filter: None,
            response_filters: None,
        }
    }

    /// Replace the route-table router.
    pub fn with_request_router(mut self, router: Arc<dyn RequestRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_chain_proxy_selector(mut self, selector: Arc<dyn ChainProxySelector>) -> Self {
        self.chain = Some(selector);
        self
    }

    pub fn with_authorization(mut self, authorization: Arc<dyn ProxyAuthorization>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn with_cache_manager(mut self, cache: Arc<dyn CacheManager>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_request_filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.request_filter = Some(filter);
        self
    }

    pub fn with_response_filters(mut self, filters: Arc<dyn ResponseFilters>) -> Self {
        self.response_filters = Some(filters);
        self
    }

    /// Live route table; replacing its contents takes effect for the next request.
    pub fn routes(&self) -> RouteTableStore {
        self.routes.clone()
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats.clone()
    }

    pub fn pool(&self) -> UpstreamPool {
        self.pool.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn context(&self) -> ProxyContext {
        let config = &self.config;
        let via = via_value(&config.proxy.via_alias);

        let router = self
            .router
            .clone()
            .unwrap_or_else(|| Arc::new(TableRouter::new(self.routes.clone())));
        let mut resolver = Resolver::new().with_router(router);
        if let Some(chain) = &self.chain {
            resolver = resolver.with_chain(chain.clone());
        }
        if let Some(default) = config.proxy.default_target.as_deref().and_then(Destination::parse) {
            resolver = resolver.with_default(default);
        }

        let settings = PipelineSettings {
            connect_timeout: Duration::from_secs(config.timeouts.connect_secs),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            write_timeout: Duration::from_secs(config.timeouts.write_secs),
            via: via.clone(),
            transparent: config.proxy.transparent,
        };
        let pipeline = RelayPipeline::new(
            resolver.clone(),
            self.cache.clone(),
            self.pool.clone(),
            self.stats.clone(),
            settings,
        )
        .with_request_filter(self.request_filter.clone())
        .with_response_filters(self.response_filters.clone());

        ProxyContext {
            resolver,
            pool: self.pool.clone(),
            pipeline,
            authorization: self.authorization.clone(),
            cache: self.cache.clone(),
            connect: config.connect.clone(),
            chunk_wait: Duration::from_millis(config.timeouts.chunk_wait_ms),
            write_timeout: Duration::from_secs(config.timeouts.write_secs),
            max_failover_attempts: config.chain.max_failover_attempts,
            via,
            stats: self.stats.clone(),
        }
    }

    /// Accept connections on `listener` until `shutdown` fires.
    ///
    /// Fails only for fatal conditions: unusable TLS material or a listener
    /// that can no longer accept.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), ProxyError> {
        let tls = match &self.config.listener.tls {
            Some(tls) => Some(load_tls_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))?),
            None => None,
        };
        let listener = Listener::from_tcp(listener, self.config.listener.max_connections)?;
        let ctx = Arc::new(self.context());

        tracing::info!(
            address = %listener.local_addr()?,
            tls = tls.is_some(),
            chained = ctx.resolver.chain_selector().is_some(),
            "Proxy server starting"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let ctx = ctx.clone();
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            let id = ConnectionId::next();
                            let guard = ctx.stats.track_client(id);
                            let _ = stream.set_nodelay(true);
                            tracing::debug!(connection_id = %id, peer = %peer, "Accepted connection");
                            serve_connection(ctx, id, stream, tls, guard).await;
                        });
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

async fn serve_connection(
    ctx: Arc<ProxyContext>,
    id: ConnectionId,
    stream: tokio::net::TcpStream,
    tls: Option<TlsAcceptor>,
    guard: crate::observability::stats::ClientGuard,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => ClientRequestHandler::new(ctx, id, stream, guard).run().await,
            Err(e) => tracing::info!(connection_id = %id, error = %e, "TLS handshake failed"),
        },
        None => ClientRequestHandler::new(ctx, id, stream, guard).run().await,
    }
}
