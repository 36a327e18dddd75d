//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, loopback-only binding)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (ID + open/total tracking)
//!     → Hand off to the proxy client handler
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection is tracked by a drop guard, so panics still release it
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionSide, ConnectionTracker};
pub use listener::{Listener, ListenerError};
