//! Resilience helpers.
//!
//! # Design Decisions
//! - Every wait on the network or on another task is bounded
//! - Retries are not generic: the only retry is chained-proxy failover,
//!   which lives in the client handler

pub mod timeouts;

pub use timeouts::with_timeout;
