//! Upstream connection management.
//!
//! # Data Flow
//! ```text
//! client handler needs "host:port"
//!     → pool.rs acquire (FIFO, per-key lock)
//!         hit  → UpstreamHandle (connected, idle relay task)
//!         miss → relay::pipeline opens a socket and spawns a relay task
//!     → UpstreamHandle::dispatch(Exchange)
//!
//! relay task finishes a keep-alive exchange
//!     → pool.rs release (bounded per key)
//! ```
//!
//! # Design Decisions
//! - The pool only ever holds handles; sockets belong to relay tasks
//! - A handle is in the pool or bound to one client, never both

pub mod connection;
pub mod pool;

pub use connection::UpstreamHandle;
pub use pool::UpstreamPool;
