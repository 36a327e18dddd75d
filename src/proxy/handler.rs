//! Client request handler.
//!
//! # Responsibilities
//! - Read requests off one client connection, in order
//! - Run each through cache, authorization and destination resolution
//! - Dispatch to a pooled or new upstream connection, with chained-proxy
//!   failover on connect errors
//! - Forward request bodies to the upstream serving them
//! - Open CONNECT tunnels
//! - Apply the closure rule when relays report back
//!
//! # States
//! ```text
//! AwaitingRequest → Dispatching → AwaitingConnection → Relaying → AwaitingRequest
//!                        ↓
//!                  TunnelEstablished
//! any → Closed
//! ```
//!
//! # Design Decisions
//! - Reads pause while a new connection is opened and the request head is
//!   written; body bytes wait for the relay's body channel for at most
//!   `chunk_wait`. On expiry the rest of that body is dropped and the relay
//!   answers the request with 504; the client connection stays open
//! - Responses never pass through this task; relays write them straight into
//!   the client's ordered writer

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{HeaderValue, VIA};
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::http::codec::{RequestDecoder, RequestEvent, ResponseDecoder, ResponseEvent};
use crate::http::message::{BodyKind, RequestHead, ResponseHead};
use crate::http::util::{bad_gateway, connect_established, proxy_error, request_authority};
use crate::net::connection::ConnectionId;
use crate::observability::stats::ClientGuard;
use crate::proxy::client::{ClientConnection, ParseMode, PendingRequestRecord};
use crate::proxy::server::ProxyContext;
use crate::proxy::tunnel::Tunnel;
use crate::proxy::writer::{ClientResponder, ResponseWriter};
use crate::relay::{BodyFrame, ClientLink, Exchange, ExchangeReady, RelayEvent, RelayPipeline};
use crate::routing::destination::Destination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingRequest,
    Dispatching,
    AwaitingConnection,
    Relaying,
    TunnelEstablished,
    Closed,
}

/// Where body bytes of the current request go.
#[derive(Debug)]
enum UpstreamSlot {
    /// No request body in progress.
    Idle,
    /// Dispatched; the relay has not written the head yet.
    Connecting(oneshot::Receiver<ExchangeReady>),
    Ready(mpsc::Sender<BodyFrame>),
    /// Body bytes are dropped (request answered locally or failed).
    Discard,
}

/// A request on its way to an upstream connection.
#[derive(Debug)]
struct DispatchTask {
    seq: u64,
    request: RequestHead,
    /// Failover attempts made so far.
    attempt: u32,
}

/// A CONNECT that succeeded; the handler turns into a tunnel.
struct TunnelStart {
    seq: u64,
    upstream: TcpStream,
    upstream_leftover: Bytes,
}

enum Flow {
    Continue,
    Tunnel(TunnelStart),
}

pub(crate) struct ClientRequestHandler<S> {
    ctx: Arc<ProxyContext>,
    conn: ClientConnection,
    reader: FramedRead<ReadHalf<S>, RequestDecoder>,
    writer: ResponseWriter,
    writer_task: JoinHandle<()>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    cancel: CancellationToken,
    slot: UpstreamSlot,
    /// Upstream connections bound to this client, per key.
    tracked: HashMap<String, HashSet<ConnectionId>>,
    next_seq: u64,
    state: HandlerState,
    read_closed: bool,
    _guard: ClientGuard,
}

impl<S> ClientRequestHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(ctx: Arc<ProxyContext>, id: ConnectionId, stream: S, guard: ClientGuard) -> Self {
        let (read, write) = tokio::io::split(stream);
        let (writer, writer_task) = ResponseWriter::spawn(id, Box::new(write));
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            conn: ClientConnection::new(id, ctx.stats.clone()),
            ctx,
            reader: FramedRead::new(read, RequestDecoder::default()),
            writer,
            writer_task,
            events_tx,
            events,
            cancel: CancellationToken::new(),
            slot: UpstreamSlot::Idle,
            tracked: HashMap::new(),
            next_seq: 0,
            state: HandlerState::AwaitingRequest,
            read_closed: false,
            _guard: guard,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(connection_id = %self.conn.id(), "Client connection opened");
        while self.state != HandlerState::Closed {
            let flow = tokio::select! {
                biased;
                Some(event) = self.events.recv() => {
                    self.on_relay_event(event).await;
                    Flow::Continue
                }
                next = self.reader.next(), if !self.read_closed => match next {
                    Some(Ok(event)) => match self.on_request_event(event).await {
                        Ok(flow) => flow,
                        Err(e) => {
                            tracing::warn!(connection_id = %self.conn.id(), error = %e, "Request processing failed");
                            self.close().await;
                            Flow::Continue
                        }
                    },
                    Some(Err(e)) => {
                        if self.conn.parse_mode() == ParseMode::AwaitingRequest {
                            tracing::info!(connection_id = %self.conn.id(), error = %e, "Malformed request, closing");
                        } else {
                            tracing::debug!(
                                connection_id = %self.conn.id(),
                                parse_mode = ?self.conn.parse_mode(),
                                error = %e,
                                "Request body cut short, closing"
                            );
                        }
                        self.close().await;
                        Flow::Continue
                    }
                    None => {
                        tracing::debug!(
                            connection_id = %self.conn.id(),
                            unanswered = self.conn.unanswered(),
                            "Client finished sending"
                        );
                        self.read_closed = true;
                        self.close_if_drained().await;
                        Flow::Continue
                    }
                },
                _ = self.cancel.cancelled() => {
                    self.state = HandlerState::Closed;
                    Flow::Continue
                }
            };
            if let Flow::Tunnel(start) = flow {
                self.run_tunnel(start).await;
                return;
            }
        }
        self.finish().await;
    }

    async fn on_request_event(&mut self, event: RequestEvent) -> Result<Flow, ProxyError> {
        match event {
            RequestEvent::Head(request) => self.on_request_head(request).await,
            RequestEvent::Body(bytes) => {
                self.forward_body(BodyFrame::Data(bytes)).await;
                Ok(Flow::Continue)
            }
            RequestEvent::End => {
                self.forward_body(BodyFrame::End).await;
                self.slot = UpstreamSlot::Idle;
                self.conn.set_parse_mode(ParseMode::AwaitingRequest);
                if self.state != HandlerState::Closed {
                    self.state = HandlerState::AwaitingRequest;
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_request_head(&mut self, request: RequestHead) -> Result<Flow, ProxyError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.conn.set_parse_mode(match request.body_kind() {
            BodyKind::Chunked => ParseMode::ReadingChunkedBody,
            BodyKind::Length(_) => ParseMode::ReadingFixedBody,
            _ => ParseMode::AwaitingRequest,
        });
        tracing::debug!(
            connection_id = %self.conn.id(),
            seq,
            method = %request.method,
            target = %request.target,
            "Request received"
        );

        let responder = ClientResponder::new();
        if self.ctx.cache.try_serve(&request, &responder) {
            tracing::debug!(connection_id = %self.conn.id(), seq, "Served from cache");
            self.answer_locally(seq, responder).await?;
            self.slot = UpstreamSlot::Discard;
            return Ok(Flow::Continue);
        }

        self.conn.request_received(PendingRequestRecord {
            seq,
            method: request.method.clone(),
            target: request.target.clone(),
            keep_alive: request.wants_keep_alive(),
            dispatched_at: Instant::now(),
        });

        if let Some(authorization) = &self.ctx.authorization {
            let responder = ClientResponder::new();
            if !authorization.authorize(&request, &responder) {
                self.conn.settle(seq);
                self.answer_locally(seq, responder).await?;
                self.slot = UpstreamSlot::Discard;
                return Ok(Flow::Continue);
            }
        }

        if request.is_connect() {
            return self.process_connect(seq, request).await;
        }
        self.dispatch(DispatchTask {
            seq,
            request,
            attempt: 0,
        })
        .await;
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, mut task: DispatchTask) {
        self.state = HandlerState::Dispatching;
        loop {
            let destination = match self.ctx.resolver.resolve(&task.request) {
                Ok(destination) => destination,
                Err(e) => {
                    tracing::warn!(connection_id = %self.conn.id(), seq = task.seq, error = %e, "Dropping request");
                    self.conn.settle(task.seq);
                    let _ = self.writer.end(task.seq).await;
                    self.slot = UpstreamSlot::Discard;
                    self.close().await;
                    return;
                }
            };
            let key = destination.key();

            let (handle, fresh) = match self.ctx.pool.acquire(&key) {
                Some(handle) => {
                    self.ctx.stats.pool_hit();
                    (handle, false)
                }
                None => {
                    self.state = HandlerState::AwaitingConnection;
                    match self.ctx.pipeline.connect(&destination, &task.request).await {
                        Ok(handle) => (handle, true),
                        Err(e) => {
                            self.ctx.stats.connect_failed();
                            tracing::warn!(
                                connection_id = %self.conn.id(),
                                seq = task.seq,
                                key = %key,
                                error = %e,
                                "Upstream connect failed"
                            );
                            if self.failover(&task.request, &destination, &mut task.attempt) {
                                continue;
                            }
                            self.on_connect_failed(task.seq).await;
                            return;
                        }
                    }
                }
            };

            self.track(&key, handle.id());
            let (ready, ready_rx) = oneshot::channel();
            let exchange = Exchange {
                seq: task.seq,
                request: task.request,
                destination,
                client: self.link(),
                ready,
            };
            if let Err(returned) = handle.dispatch(exchange).await {
                self.untrack(&key, handle.id());
                task.request = returned.request;
                if fresh {
                    self.on_connect_failed(task.seq).await;
                    return;
                }
                tracing::debug!(connection_id = %self.conn.id(), key = %key, "Pooled connection went away, retrying");
                continue;
            }

            self.slot = UpstreamSlot::Connecting(ready_rx);
            self.state = HandlerState::Relaying;
            if fresh {
                self.await_ready(self.ctx.write_timeout).await;
            }
            return;
        }
    }

    /// Drop idle connections to a destination that refused a connect, report
    /// the failure to the chain selector and decide whether an alternate
    /// upstream should be tried.
    fn failover(&self, request: &RequestHead, destination: &Destination, attempt: &mut u32) -> bool {
        let key = destination.key();
        let evicted = self.ctx.pool.evict(&key);
        if evicted > 0 {
            tracing::debug!(connection_id = %self.conn.id(), key = %key, evicted, "Evicted idle connections after connect failure");
        }
        if !destination.is_chained() {
            return false;
        }
        let Some(selector) = self.ctx.resolver.chain_selector() else {
            return false;
        };
        selector.on_connection_error(&key);
        if *attempt >= self.ctx.max_failover_attempts {
            return false;
        }
        match selector.select_upstream(request) {
            Some(alternate) if alternate != key => {
                *attempt += 1;
                tracing::info!(connection_id = %self.conn.id(), failed = %key, alternate = %alternate, "Failing over to alternate upstream");
                true
            }
            _ => false,
        }
    }

    async fn on_connect_failed(&mut self, seq: u64) {
        let _ = self.writer.respond(seq, bad_gateway(&self.ctx.via)).await;
        self.slot = UpstreamSlot::Discard;
        self.state = HandlerState::AwaitingRequest;
        if self.conn.on_channel_closed(&[seq], true, self.tracked_count()) {
            self.close().await;
        }
    }

    /// Wait for the relay to accept the current request head.
    async fn await_ready(&mut self, wait: Duration) {
        let UpstreamSlot::Connecting(rx) = &mut self.slot else {
            return;
        };
        let outcome = tokio::time::timeout(wait, rx).await;
        self.slot = match outcome {
            Ok(Ok(ExchangeReady { body: Some(tx) })) => UpstreamSlot::Ready(tx),
            Ok(Ok(ExchangeReady { body: None })) => UpstreamSlot::Idle,
            // The relay failed before writing the head and reports that itself.
            Ok(Err(_)) => UpstreamSlot::Discard,
            Err(_) => {
                tracing::warn!(connection_id = %self.conn.id(), "Upstream not ready in time, discarding request body");
                UpstreamSlot::Discard
            }
        };
    }

    async fn forward_body(&mut self, frame: BodyFrame) {
        if matches!(self.slot, UpstreamSlot::Connecting(_)) {
            self.await_ready(self.ctx.chunk_wait).await;
        }
        if let UpstreamSlot::Ready(tx) = &self.slot {
            if tx.send(frame).await.is_err() {
                self.slot = UpstreamSlot::Discard;
            }
        }
    }

    /// Write what a collaborator answered into slot `seq`, or just close the slot.
    async fn answer_locally(&self, seq: u64, responder: ClientResponder) -> Result<(), ProxyError> {
        match responder.into_response() {
            Some(response) => self.writer.respond(seq, response).await,
            None => self.writer.end(seq).await,
        }
    }

    async fn process_connect(&mut self, seq: u64, request: RequestHead) -> Result<Flow, ProxyError> {
        self.state = HandlerState::Dispatching;
        let Some((host, port)) = request_authority(&request) else {
            return self.refuse_connect(seq, ProxyError::NoRoute(request.target.clone())).await;
        };
        if !self.ctx.connect.allows(port) {
            return self.refuse_connect(seq, ProxyError::PortNotAllowed(port)).await;
        }

        let mut attempt = 0;
        let (destination, mut upstream) = loop {
            let destination = self
                .ctx
                .resolver
                .chain_selector()
                .and_then(|selector| selector.select_upstream(&request))
                .and_then(|upstream| Destination::parse(&upstream))
                .map(Destination::chained)
                .unwrap_or_else(|| Destination::new(host.clone(), port));

            self.state = HandlerState::AwaitingConnection;
            match self.ctx.pipeline.open_socket(&destination).await {
                Ok(stream) => break (destination, stream),
                Err(e) => {
                    self.ctx.stats.connect_failed();
                    if self.failover(&request, &destination, &mut attempt) {
                        continue;
                    }
                    return self.refuse_connect(seq, e).await;
                }
            }
        };

        let upstream_leftover = if destination.is_chained() {
            let handshake = open_chained_tunnel(&self.ctx.pipeline, &mut upstream, &request).await;
            let (mut head, leftover) = match handshake {
                Ok(response) => response,
                Err(e) => return self.refuse_connect(seq, e).await,
            };
            if let Ok(via) = HeaderValue::from_str(&self.ctx.via) {
                head.headers.append(VIA, via);
            }
            let established = head.status.is_success();
            self.writer.frame(seq, head.encode()).await?;
            if !established {
                tracing::info!(connection_id = %self.conn.id(), status = %head.status, "Chained proxy refused tunnel");
                self.writer.frame(seq, leftover).await?;
                self.writer.end(seq).await?;
                self.conn.settle(seq);
                self.close().await;
                return Ok(Flow::Continue);
            }
            self.writer.end(seq).await?;
            leftover
        } else {
            self.writer.respond(seq, connect_established(&self.ctx.via)).await?;
            Bytes::new()
        };

        tracing::debug!(connection_id = %self.conn.id(), seq, destination = %destination, "Tunnel established");
        self.conn.settle(seq);
        self.state = HandlerState::TunnelEstablished;
        self.ctx.stats.tunnel_opened();
        Ok(Flow::Tunnel(TunnelStart {
            seq,
            upstream,
            upstream_leftover,
        }))
    }

    async fn refuse_connect(&mut self, seq: u64, reason: ProxyError) -> Result<Flow, ProxyError> {
        tracing::info!(connection_id = %self.conn.id(), seq, reason = %reason, "Refusing CONNECT");
        self.conn.settle(seq);
        self.writer.respond(seq, proxy_error(&self.ctx.via)).await?;
        self.close().await;
        Ok(Flow::Continue)
    }

    async fn run_tunnel(mut self, start: TunnelStart) {
        let Some(client_write) = self.writer.detach(start.seq).await else {
            tracing::debug!(connection_id = %self.conn.id(), "Client writer gone before tunnel start");
            self.cancel.cancel();
            return;
        };
        // Relays for earlier requests are done once the writer let go.
        self.cancel.cancel();
        let client_leftover = self.reader.read_buffer_mut().split().freeze();
        let tunnel = Tunnel {
            connection: self.conn.id(),
            client_read: self.reader.into_inner(),
            client_write,
            client_leftover,
            upstream: start.upstream,
            upstream_leftover: start.upstream_leftover,
        };
        if let Err(e) = tunnel.run().await {
            tracing::debug!(error = %e, "Tunnel ended with error");
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        let close = match event {
            RelayEvent::ResponseRelayed { seq, .. } => self.conn.on_response_relayed(seq),
            RelayEvent::ChannelClosed {
                connection,
                key,
                unanswered,
                closed_ends_body,
            } => {
                self.untrack(&key, connection);
                if closed_ends_body {
                    tracing::debug!(connection_id = %self.conn.id(), upstream_id = %connection, key = %key, "Upstream close ended a response");
                }
                self.conn.on_channel_closed(&unanswered, closed_ends_body, self.tracked_count())
            }
            RelayEvent::Detached { connection, key } => {
                self.untrack(&key, connection);
                false
            }
        };
        if close {
            self.close().await;
        } else {
            self.close_if_drained().await;
        }
    }

    async fn close_if_drained(&mut self) {
        if self.read_closed && self.conn.unanswered() == 0 {
            self.close().await;
        }
    }

    /// Flush what is queued, then close. Only the first call has an effect.
    async fn close(&mut self) {
        if !self.conn.mark_closing() {
            return;
        }
        tracing::debug!(
            connection_id = %self.conn.id(),
            peer_closed_early = self.conn.peer_closed_early(),
            "Closing client connection"
        );
        self.state = HandlerState::Closed;
        self.writer.close().await;
        self.cancel.cancel();
    }

    async fn finish(mut self) {
        self.close().await;
        let write_timeout = self.ctx.write_timeout;
        if tokio::time::timeout(write_timeout, &mut self.writer_task).await.is_err() {
            self.writer_task.abort();
        }
        tracing::debug!(connection_id = %self.conn.id(), "Client connection closed");
    }

    fn link(&self) -> ClientLink {
        ClientLink {
            id: self.conn.id(),
            writer: self.writer.clone(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn track(&mut self, key: &str, id: ConnectionId) {
        self.tracked.entry(key.to_string()).or_default().insert(id);
    }

    fn untrack(&mut self, key: &str, id: ConnectionId) {
        if let Some(ids) = self.tracked.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.tracked.remove(key);
            }
        }
    }

    fn tracked_count(&self) -> usize {
        self.tracked.values().map(HashSet::len).sum()
    }
}

/// Forward CONNECT to a chained proxy and read its answer, plus any bytes
/// after the answer's head.
async fn open_chained_tunnel(
    pipeline: &RelayPipeline,
    upstream: &mut TcpStream,
    request: &RequestHead,
) -> Result<(ResponseHead, Bytes), ProxyError> {
    pipeline
        .write_timeout("writing CONNECT head", upstream.write_all(&request.encode()))
        .await?;
    let wait = pipeline.settings().idle_timeout;
    let mut framed = FramedRead::new(upstream, ResponseDecoder::new(Method::CONNECT));
    loop {
        let event = tokio::time::timeout(wait, framed.next())
            .await
            .map_err(|_| ProxyError::Timeout("waiting for tunnel response"))?;
        match event {
            Some(Ok(ResponseEvent::Head(head))) if head.is_interim() => continue,
            Some(Ok(ResponseEvent::Head(head))) => {
                let leftover = framed.read_buffer_mut().split().freeze();
                return Ok((head, leftover));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProxyError::UpstreamClosed),
        }
    }
}
