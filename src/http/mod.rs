//! HTTP/1.x wire handling.
//!
//! # Data Flow
//! ```text
//! client socket bytes
//!     → codec.rs RequestDecoder (Head, Body*, End)
//!     → proxy handler / relay encoder (message.rs heads)
//!     → upstream socket
//!
//! upstream socket bytes
//!     → codec.rs ResponseDecoder (Head, Body*, End { by_close })
//!     → relay handler
//!     → client writer
//! ```
//!
//! # Design Decisions
//! - Only heads are parsed into structured values; bodies stay raw bytes
//! - Header names are carried in `http::HeaderMap`, so they go out lower-cased
//! - Locally generated responses (CONNECT, 502) are fixed byte blocks in util.rs

pub mod codec;
pub mod message;
pub mod util;

pub use codec::{CodecError, RequestDecoder, RequestEvent, ResponseDecoder, ResponseEvent};
pub use message::{BodyKind, RequestHead, ResponseHead};
