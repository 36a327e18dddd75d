//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Open connections finish on their own
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup lives in `main`: config, logging, metrics, proxy, admin
//! - Shutdown stops the accept loop; in-flight exchanges are not interrupted

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
