//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::routing::destination::Protocol;

/// Root configuration for the relay proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Upstream connection pool settings.
    pub pool: PoolConfig,

    /// Chained upstream proxies.
    pub chain: ChainConfig,

    /// CONNECT policy.
    pub connect: ConnectConfig,

    /// Proxy identity and pass-through behavior.
    pub proxy: ProxySettings,

    /// Reverse-proxy routes (`[[routes]]`).
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Bind to loopback regardless of `bind_address`'s host.
    pub local_only: bool,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            local_only: false,
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Idle timeout for upstream connections, pooled or waiting on a response.
    pub idle_secs: u64,

    /// How long body bytes wait for their upstream connection, in milliseconds.
    pub chunk_wait_ms: u64,

    /// Socket write timeout in seconds.
    pub write_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 40,
            idle_secs: 70,
            chunk_wait_ms: 4000,
            write_secs: 70,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per `host:port`; 0 disables pooling.
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle_per_host: 32 }
    }
}

/// Chained proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Upstream proxies as `host:port`, in order of preference.
    pub upstreams: Vec<String>,

    /// Alternate upstreams tried after a connect failure.
    pub max_failover_attempts: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            max_failover_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Ports CONNECT may reach. Empty allows every port.
    pub allowed_ports: Vec<u16>,
}

impl ConnectConfig {
    pub fn allows(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.contains(&port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Name used in `Via: 1.1 <alias>`.
    pub via_alias: String,

    /// Forward requests untouched (no normalization, no `Via`).
    pub transparent: bool,

    /// `host:port` used when nothing else resolves a request.
    pub default_target: Option<String>,

    /// Required `Proxy-Authorization` value, e.g. `Basic dXNlcjpwYXNz`.
    pub proxy_authorization: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            via_alias: "relay-proxy".to_string(),
            transparent: false,
            default_target: None,
            proxy_authorization: None,
        }
    }
}

/// Route mapping a request path (and optionally host) to a destination.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging.
    pub name: Option<String>,

    /// Host to match (exact, port ignored).
    pub match_host: Option<String>,

    /// Exact path to match.
    pub path: Option<String>,

    /// Path prefix to match when `path` is not set.
    pub path_prefix: Option<String>,

    /// Destination `host:port`.
    pub target: String,

    /// Request target sent upstream instead of the original.
    pub rewrite: Option<String>,

    pub protocol: Option<Protocol>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter, e.g. "info" or "relay_proxy=debug".
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Admin API bind address.
    pub address: String,

    /// Bearer token required by the admin API. Empty disables the check.
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9091".to_string(),
            api_key: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.timeouts.connect_secs, 40);
        assert_eq!(config.timeouts.chunk_wait_ms, 4000);
        assert_eq!(config.pool.max_idle_per_host, 32);
        assert_eq!(config.chain.max_failover_attempts, 1);
        assert_eq!(config.proxy.via_alias, "relay-proxy");
        assert!(config.connect.allows(8443));
    }

    #[test]
    fn parses_full_config() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "0.0.0.0:1080"
            local_only = true

            [chain]
            upstreams = ["proxy-a:3128", "proxy-b:3128"]

            [connect]
            allowed_ports = [443]

            [[routes]]
            path = "/1"
            target = "localhost:8081"
            rewrite = "/one"

            [[routes]]
            name = "api"
            match_host = "api.local"
            path_prefix = "/v1"
            target = "localhost:8082"
            protocol = "https"
            "#,
        )
        .unwrap();

        assert!(config.listener.local_only);
        assert_eq!(config.chain.upstreams.len(), 2);
        assert!(config.connect.allows(443));
        assert!(!config.connect.allows(25));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].rewrite.as_deref(), Some("/one"));
        assert_eq!(config.routes[1].protocol, Some(Protocol::Https));
    }
}
