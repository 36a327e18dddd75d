//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! client handlers, relay tasks, server
//!     → stats.rs (ProxyStats atomics, admin snapshot)
//!         → metrics.rs (metrics facade → optional Prometheus exporter)
//!     → tracing events (logging.rs installs the subscriber)
//! ```
//!
//! # Design Decisions
//! - Connection IDs (`conn-N`) appear as `connection_id` / `upstream_id`
//!   fields on every event about a connection
//! - Counters are plain atomics; the snapshot is not transactional

pub mod logging;
pub mod metrics;
pub mod stats;

pub use stats::{ProxyStats, StatsSnapshot};
