//! Relay proxy (v1)
//!
//! An intercepting HTTP/HTTPS forward and reverse proxy built on Tokio.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────────┐
//!                    │                       RELAY PROXY                         │
//!   Client           │  ┌──────────┐   ┌──────────────┐   ┌──────────────────┐  │
//!   ─────────────────┼─▶│   net    │──▶│    proxy     │──▶│     routing      │  │
//!                    │  │ listener │   │client handler│   │ chain → router → │  │
//!                    │  │  + TLS   │   └──────┬───────┘   │ target → default │  │
//!                    │  └──────────┘          │           └────────┬─────────┘  │
//!                    │                        ▼                    ▼            │
//!                    │                 ┌────────────┐     ┌─────────────────┐   │
//!                    │                 │  upstream  │◀────│      relay      │   │
//!                    │                 │    pool    │     │ encoder/pipeline│───┼──▶ Origin or
//!   ◀────────────────┼─────────────────│  ordered   │◀────│  relay handler  │◀──┼─── chained proxy
//!                    │                 │   writer   │     └─────────────────┘   │
//!                    │                 └────────────┘                           │
//!                    │  config · observability · admin · lifecycle · security   │
//!                    └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use relay_proxy::admin::{setup_admin_router, AdminState};
use relay_proxy::config::loader::load_config;
use relay_proxy::config::watcher::ConfigWatcher;
use relay_proxy::lifecycle::signals::shutdown_on_signal;
use relay_proxy::net::listener::bind_address;
use relay_proxy::observability::{logging, metrics};
use relay_proxy::routing::table::RouteTable;
use relay_proxy::{ProxyConfig, ProxyServer, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "relay-proxy", version, about = "Intercepting HTTP/HTTPS relay proxy")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configured bind address's port
    #[arg(short, long)]
    port: Option<u16>,

    /// Only accept connections on loopback
    #[arg(long)]
    local_only: bool,

    /// Chained upstream proxy (host:port), may be repeated
    #[arg(long = "chain")]
    chain: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    apply_args(&mut config, &args)?;

    logging::init(Some(&config.observability.log_level));
    tracing::info!("relay-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        local_only = config.listener.local_only,
        max_connections = config.listener.max_connections,
        routes = config.routes.len(),
        chained = config.chain.upstreams.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(bind_address(&config.listener)?).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = ProxyServer::new(config.clone());
    let routes = server.routes();

    if config.admin.enabled {
        let state = AdminState {
            stats: server.stats(),
            pool: server.pool(),
            routes: routes.clone(),
            api_key: config.admin.api_key.clone(),
        };
        let admin_listener = TcpListener::bind(&config.admin.address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        let mut admin_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, setup_admin_router(state))
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
    }

    // Keep the watcher alive for the life of the process.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let routes = routes.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    let table = RouteTable::from_config(&new_config.routes);
                    tracing::info!(routes = table.len(), "Route table reloaded");
                    routes.replace(table);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let mut proxy = tokio::spawn(server.run(listener, shutdown.subscribe()));
    tokio::select! {
        result = &mut proxy => result??,
        _ = shutdown_on_signal(&shutdown) => proxy.await??,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn apply_args(config: &mut ProxyConfig, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = args.port {
        let mut addr: std::net::SocketAddr = config.listener.bind_address.parse()?;
        addr.set_port(port);
        config.listener.bind_address = addr.to_string();
    }
    if args.local_only {
        config.listener.local_only = true;
    }
    if !args.chain.is_empty() {
        config.chain.upstreams = args.chain.clone();
    }
    Ok(())
}
