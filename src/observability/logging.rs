//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber once at startup
//! - Honour `RUST_LOG`, falling back to the configured level

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when neither `RUST_LOG` nor a configured level is set.
pub const DEFAULT_FILTER: &str = "relay_proxy=info,tower_http=info";

/// Install the global subscriber. `level` is a level name (`debug`) or a
/// full filter directive; `RUST_LOG` wins over both.
pub fn init(level: Option<&str>) {
    let fallback = match level {
        Some(level) if !level.contains('=') && !level.is_empty() => {
            format!("relay_proxy={level},tower_http={level}")
        }
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => DEFAULT_FILTER.to_string(),
    };

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
