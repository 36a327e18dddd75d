//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request head (target, Host)
//!     → resolver.rs
//!         → chain.rs (upstream proxy override)
//!         → router.rs (StaticRouter | TableRouter | ChainRouter)
//!             → table.rs + matcher.rs (host / exact path / path prefix)
//!         → host:port parsed from the target
//!         → configured default
//!     → Destination (destination.rs)
//!
//! Route table reload:
//!     [[routes]] config
//!     → RouteTable::from_config
//!     → RouteTableStore::replace (atomic swap)
//! ```
//!
//! # Design Decisions
//! - Resolution is a pure lookup; no I/O, no locks held across awaits
//! - The route table is replaced whole, never edited in place
//! - Malformed targets never fail resolution on their own; they fall through
//!   to the next step

pub mod chain;
pub mod destination;
pub mod matcher;
pub mod resolver;
pub mod router;
pub mod table;

pub use chain::{ChainProxySelector, StaticChainSelector};
pub use destination::{Destination, Protocol};
pub use resolver::Resolver;
pub use router::{ChainRouter, RequestRouter, StaticRouter, TableRouter};
pub use table::{RouteTable, RouteTableStore};
