//! Upstream relay subsystem.
//!
//! # Data Flow
//! ```text
//! client handler
//!     → Exchange { seq, request, destination, client link }
//!     → UpstreamHandle::dispatch
//!     → handler.rs relay task
//!         → encoder.rs (request copy, normalize, filter, rewrite, Via)
//!         → upstream socket
//!         ← ResponseDecoder events
//!         → pipeline.rs mode (stream | decompress + aggregate + filter)
//!         → client ResponseWriter slot `seq`
//!     → RelayEvent back to the client handler
//!         ResponseRelayed | ChannelClosed | Detached
//!     → pool release or close
//! ```
//!
//! # Design Decisions
//! - One task per upstream socket; it owns both halves and runs exchanges
//!   one after another
//! - The client handler is told about completions and closures through an
//!   unbounded channel, so a relay never waits on a busy client task
//! - Request bodies flow through a small bounded channel, giving the client
//!   reader backpressure from the upstream socket

pub mod encoder;
pub mod handler;
pub mod pipeline;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::http::message::RequestHead;
use crate::net::connection::ConnectionId;
use crate::proxy::writer::ResponseWriter;
use crate::routing::destination::Destination;

pub use pipeline::{RelayPipeline, ResponseMode};

/// Capacity of the per-request body channel.
pub const BODY_CHANNEL_CAPACITY: usize = 16;

/// One piece of a request body, raw as received from the client.
#[derive(Debug)]
pub enum BodyFrame {
    Data(Bytes),
    End,
}

/// What the client handler needs to know once a request head is on the wire.
#[derive(Debug)]
pub struct ExchangeReady {
    /// Where to send body frames, when the request has a body.
    pub body: Option<mpsc::Sender<BodyFrame>>,
}

/// The client a relay is currently working for.
#[derive(Debug, Clone)]
pub struct ClientLink {
    pub id: ConnectionId,
    pub writer: ResponseWriter,
    pub events: mpsc::UnboundedSender<RelayEvent>,
    /// Cancelled when the client connection goes away.
    pub cancel: CancellationToken,
}

/// A request handed to a relay task.
#[derive(Debug)]
pub struct Exchange {
    /// Response slot in the client's writer.
    pub seq: u64,
    /// The request exactly as the client sent it.
    pub request: RequestHead,
    pub destination: Destination,
    pub client: ClientLink,
    /// Fulfilled once the head is written; dropped if that fails.
    pub ready: oneshot::Sender<ExchangeReady>,
}

/// Notifications from relay tasks to the client handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The response to `seq` has been completely handed to the client writer.
    ResponseRelayed { connection: ConnectionId, key: String, seq: u64 },
    /// The upstream connection closed.
    ChannelClosed {
        connection: ConnectionId,
        key: String,
        /// Requests the connection was working on, at most one.
        unanswered: Vec<u64>,
        /// The close itself delimited (or cut short) a response body.
        closed_ends_body: bool,
    },
    /// The connection was rebound to another client.
    Detached { connection: ConnectionId, key: String },
}
