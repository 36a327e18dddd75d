//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request head:
//!     → cache collaborator (may answer locally)
//!     → auth.rs ProxyAuthorization (may answer 407 locally)
//!     → routing
//! ```
//!
//! # Design Decisions
//! - Fail closed: a rejected request is answered and never forwarded
//! - Rejection is per request; the client connection stays usable

pub mod auth;

pub use auth::{ProxyAuthorization, StaticCredentials};
