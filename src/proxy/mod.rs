//! Client side of the proxy.
//!
//! # Data Flow
//! ```text
//! accepted socket (plain or TLS)
//!     → server.rs spawns a handler task
//!     → handler.rs ClientRequestHandler
//!         RequestDecoder events
//!         → cache / authorization / resolver
//!         → pool or relay pipeline → Exchange
//!         → body frames to the relay
//!     ← RelayEvent (relayed, channel closed, detached)
//!         → client.rs closure rule
//!     writer.rs OrderedWriter ← response bytes straight from relays
//!
//! CONNECT:
//!     handler.rs → 200 (or chained proxy's answer) → writer detach
//!     → tunnel.rs byte relay
//! ```

pub mod client;
pub mod handler;
pub mod server;
pub mod tunnel;
pub mod writer;

pub use server::ProxyServer;
pub use writer::{ClientResponder, ResponseWriter};
