//! Intercepting HTTP/HTTPS relay proxy library.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod proxy;
pub mod relay;
pub mod routing;
pub mod upstream;

// Collaborators
pub mod cache;
pub mod filter;
pub mod security;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use proxy::ProxyServer;
