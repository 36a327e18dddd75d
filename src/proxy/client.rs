//! Per-client bookkeeping: parse mode, unanswered requests and closure.
//!
//! # Responsibilities
//! - Keep the ordered queue of requests that have no complete response yet
//! - Decide when the client connection must close, and close it once
//!
//! # Closure Rule
//! ```text
//! ResponseRelayed(seq)            → remove seq
//!                                   close if queue empty and (peer closed early
//!                                   or the exchange asked for close)
//! ChannelClosed(unanswered, ends) → ends ⇒ peer closed early
//!                                   remove each unanswered seq (once)
//!                                   close if peer closed early and
//!                                   (queue empty or no tracked upstreams left)
//! ```

use std::collections::VecDeque;
use std::time::Instant;

use http::Method;

use crate::net::connection::ConnectionId;
use crate::observability::ProxyStats;

/// Where the client reader is inside the request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    AwaitingRequest,
    ReadingChunkedBody,
    ReadingFixedBody,
}

/// One request still waiting for its complete response.
#[derive(Debug, Clone)]
pub struct PendingRequestRecord {
    pub seq: u64,
    pub method: Method,
    pub target: String,
    pub keep_alive: bool,
    pub dispatched_at: Instant,
}

/// Unanswered requests in arrival order.
#[derive(Debug, Default)]
pub struct InFlight {
    records: VecDeque<PendingRequestRecord>,
}

impl InFlight {
    pub fn push(&mut self, record: PendingRequestRecord) {
        self.records.push_back(record);
    }

    /// Remove the record for `seq`, if it is still queued.
    pub fn remove(&mut self, seq: u64) -> Option<PendingRequestRecord> {
        let index = self.records.iter().position(|r| r.seq == seq)?;
        self.records.remove(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    parse_mode: ParseMode,
    in_flight: InFlight,
    peer_closed_early: bool,
    close_requested: bool,
    closing: bool,
    stats: ProxyStats,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, stats: ProxyStats) -> Self {
        Self {
            id,
            parse_mode: ParseMode::AwaitingRequest,
            in_flight: InFlight::default(),
            peer_closed_early: false,
            close_requested: false,
            closing: false,
            stats,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn parse_mode(&self) -> ParseMode {
        self.parse_mode
    }

    pub fn set_parse_mode(&mut self, mode: ParseMode) {
        self.parse_mode = mode;
    }

    pub fn unanswered(&self) -> usize {
        self.in_flight.len()
    }

    pub fn peer_closed_early(&self) -> bool {
        self.peer_closed_early
    }

    pub fn request_received(&mut self, record: PendingRequestRecord) {
        self.stats.request_received(&record.method);
        self.in_flight.push(record);
    }

    /// Drop `seq` from the queue without touching the closure flags.
    pub fn settle(&mut self, seq: u64) -> Option<PendingRequestRecord> {
        let record = self.in_flight.remove(seq)?;
        self.stats.request_settled();
        Some(record)
    }

    /// The response to `seq` was completely handed to the writer.
    /// Returns true if the connection should close now.
    pub fn on_response_relayed(&mut self, seq: u64) -> bool {
        if let Some(record) = self.settle(seq) {
            tracing::trace!(
                connection_id = %self.id,
                seq,
                method = %record.method,
                target = %record.target,
                elapsed_ms = record.dispatched_at.elapsed().as_millis() as u64,
                "Response relayed"
            );
            if !record.keep_alive {
                self.close_requested = true;
            }
        }
        self.in_flight.is_empty() && (self.peer_closed_early || self.close_requested)
    }

    /// An upstream connection bound to this client closed.
    /// `tracked_remaining` is the number of upstream connections still tracked.
    /// Returns true if the connection should close now.
    pub fn on_channel_closed(&mut self, unanswered: &[u64], closed_ends_body: bool, tracked_remaining: usize) -> bool {
        if closed_ends_body {
            self.peer_closed_early = true;
        }
        for seq in unanswered {
            self.settle(*seq);
        }
        self.peer_closed_early && (self.in_flight.is_empty() || tracked_remaining == 0)
    }

    /// Returns true only for the first call.
    pub fn mark_closing(&mut self) -> bool {
        !std::mem::replace(&mut self.closing, true)
    }
}
