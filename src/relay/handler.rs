//! Relay task for one upstream connection.
//!
//! # Responsibilities
//! - Write each dispatched request (head, then body frames) to the upstream
//! - Read the response and hand it to the bound client's writer slot
//! - Report completion and closure to the bound client
//! - Put itself back in the pool after a clean keep-alive exchange
//! - Watch the socket while idle and leave the pool when it dies
//!
//! # Connection States
//! ```text
//! Idle (pooled or fresh) → Exchanging → Idle
//!                               ↓
//!                            Closed  (non keep-alive, close-delimited,
//!                                     error, client gone, idle timeout)
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header::{HeaderValue, VIA};
use http::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheManager;
use crate::error::ProxyError;
use crate::http::codec::{ResponseDecoder, ResponseEvent};
use crate::http::message::{keep_alive, RequestHead, ResponseHead};
use crate::http::util::{bad_gateway, gateway_timeout};
use crate::net::connection::{ConnectionGuard, ConnectionId};
use crate::observability::ProxyStats;
use crate::relay::encoder::{EncodeListener, RequestEncoder};
use crate::relay::pipeline::{Aggregator, ResponseMode};
use crate::relay::{BodyFrame, ClientLink, Exchange, ExchangeReady, RelayEvent, BODY_CHANNEL_CAPACITY};
use crate::resilience::with_timeout;
use crate::upstream::{UpstreamHandle, UpstreamPool};

/// Everything a relay task is built from.
pub(crate) struct RelayParts {
    pub id: ConnectionId,
    pub key: String,
    pub stream: TcpStream,
    pub handle: UpstreamHandle,
    pub exchanges: mpsc::Receiver<Exchange>,
    pub encoder: RequestEncoder,
    pub mode: ResponseMode,
    pub pool: UpstreamPool,
    pub cache: Arc<dyn CacheManager>,
    pub guard: ConnectionGuard,
    pub stats: ProxyStats,
    pub via: String,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

/// The most recently encoded original request, until its response has been
/// handed over. Whatever is left here when the connection closes is reported
/// as unanswered.
#[derive(Debug, Default)]
struct CurrentRequest {
    seq: Option<u64>,
    method: Option<Method>,
    target: String,
}

impl EncodeListener for CurrentRequest {
    fn request_encoded(&mut self, seq: u64, original: &RequestHead) {
        self.seq = Some(seq);
        self.method = Some(original.method.clone());
        self.target = original.target.clone();
    }
}

enum Completion {
    /// Response delimited by framing and both sides want to persist.
    Reusable,
    /// Response delimited by framing; the connection must close.
    Close,
    /// The upstream closing the socket delimited the response.
    EndedByClose,
    /// The client stopped waiting for the body channel; the request head is
    /// on the wire without its body.
    Abandoned,
}

enum Exit {
    Idle(&'static str),
    Finished,
    /// The close cut short or delimited the current response.
    Failed,
    /// The current request was answered locally and the connection cannot be reused.
    Abandoned,
}

pub(crate) struct RelayHandler {
    id: ConnectionId,
    key: String,
    reader: FramedRead<OwnedReadHalf, ResponseDecoder>,
    writer: OwnedWriteHalf,
    handle: UpstreamHandle,
    exchanges: mpsc::Receiver<Exchange>,
    shutdown: CancellationToken,
    encoder: RequestEncoder,
    mode: ResponseMode,
    pool: UpstreamPool,
    cache: Arc<dyn CacheManager>,
    stats: ProxyStats,
    via: String,
    idle_timeout: Duration,
    write_timeout: Duration,
    bound: Option<ClientLink>,
    current: CurrentRequest,
    /// Whether any part of the current response reached the client writer.
    forwarded: bool,
    _guard: ConnectionGuard,
}

impl RelayHandler {
    pub(crate) fn new(parts: RelayParts) -> Self {
        let (read, write) = parts.stream.into_split();
        Self {
            id: parts.id,
            key: parts.key,
            reader: FramedRead::new(read, ResponseDecoder::default()),
            writer: write,
            shutdown: parts.handle.shutdown_token(),
            handle: parts.handle,
            exchanges: parts.exchanges,
            encoder: parts.encoder,
            mode: parts.mode,
            pool: parts.pool,
            cache: parts.cache,
            stats: parts.stats,
            via: parts.via,
            idle_timeout: parts.idle_timeout,
            write_timeout: parts.write_timeout,
            bound: None,
            current: CurrentRequest::default(),
            forwarded: false,
            _guard: parts.guard,
        }
    }

    pub(crate) async fn run(mut self) {
        let exit = loop {
            let exchange = tokio::select! {
                // A queued exchange wins over EOF or the idle timer; it was
                // handed over and must be answered.
                biased;
                next = self.exchanges.recv() => match next {
                    Some(exchange) => exchange,
                    None => break Exit::Idle("handle dropped"),
                },
                event = self.reader.next() => break match event {
                    None => Exit::Idle("closed by upstream"),
                    Some(Ok(_)) => Exit::Idle("unsolicited data from upstream"),
                    Some(Err(_)) => Exit::Idle("read error"),
                },
                _ = self.shutdown.cancelled() => break Exit::Idle("closed by pool"),
                _ = tokio::time::sleep(self.idle_timeout) => break Exit::Idle("idle timeout"),
            };

            let seq = exchange.seq;
            match self.process(exchange).await {
                Ok(Completion::Reusable) => {
                    self.notify_relayed();
                    if self.pool.release(&self.key, self.handle.clone()) {
                        tracing::trace!(upstream_id = %self.id, key = %self.key, "Returned to pool");
                        continue;
                    }
                    break Exit::Finished;
                }
                Ok(Completion::Close) => {
                    self.notify_relayed();
                    break Exit::Finished;
                }
                Ok(Completion::EndedByClose) => break Exit::Failed,
                Ok(Completion::Abandoned) => break Exit::Abandoned,
                Err(error) => {
                    self.fail_exchange(seq, &error).await;
                    break Exit::Failed;
                }
            }
        };
        self.close(exit).await;
    }

    async fn process(&mut self, exchange: Exchange) -> Result<Completion, ProxyError> {
        let Exchange {
            seq,
            request,
            destination,
            client,
            ready,
        } = exchange;
        self.bind(&client);
        self.forwarded = false;

        let wire = self.encoder.encode(seq, &request, &destination, &mut self.current);
        self.reader.decoder_mut().expect_response_to(request.method.clone());
        tracing::debug!(
            upstream_id = %self.id,
            connection_id = %client.id,
            seq,
            method = %request.method,
            target = %self.current.target,
            destination = %destination,
            "Relaying request"
        );

        with_timeout(self.write_timeout, "writing request head", self.writer.write_all(&wire)).await?;

        let mut body = if request.body_kind().has_body() {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            if ready.send(ExchangeReady { body: Some(tx) }).is_err() {
                tracing::info!(upstream_id = %self.id, connection_id = %client.id, seq, "Request body abandoned by client");
                client.writer.respond(seq, gateway_timeout(&self.via)).await?;
                return Ok(Completion::Abandoned);
            }
            Some(rx)
        } else {
            let _ = ready.send(ExchangeReady { body: None });
            None
        };

        let mut aggregator = match &self.mode {
            ResponseMode::Aggregate(filter) => Some(Aggregator::new(filter.clone())),
            ResponseMode::Stream => None,
        };
        let mut final_head: Option<ResponseHead> = None;

        loop {
            let idle = tokio::time::sleep(self.idle_timeout);
            tokio::select! {
                frame = next_body_frame(&mut body), if body.is_some() => match frame {
                    Some(BodyFrame::Data(bytes)) => {
                        with_timeout(self.write_timeout, "writing request body", self.writer.write_all(&bytes)).await?;
                    }
                    Some(BodyFrame::End) => body = None,
                    None => return Err(ProxyError::BodyAborted),
                },
                event = self.reader.next() => match event {
                    Some(Ok(ResponseEvent::Head(mut head))) => {
                        self.add_via(&mut head);
                        if head.is_interim() {
                            client.writer.frame(seq, head.encode()).await?;
                            self.forwarded = true;
                            continue;
                        }
                        self.stats.response_relayed(head.status);
                        match aggregator.as_mut() {
                            Some(aggregator) => aggregator.head(head.clone()),
                            None => {
                                client.writer.frame(seq, head.encode()).await?;
                                self.forwarded = true;
                            }
                        }
                        final_head = Some(head);
                    }
                    Some(Ok(ResponseEvent::Body(bytes))) => match aggregator.as_mut() {
                        Some(aggregator) => aggregator.push(&bytes)?,
                        None => client.writer.frame(seq, bytes).await?,
                    },
                    Some(Ok(ResponseEvent::End { by_close })) => {
                        let head = final_head.ok_or(ProxyError::UpstreamClosed)?;
                        if let Some(aggregator) = aggregator.take() {
                            let full = aggregator.finish(&request)?;
                            self.cache.store(&request, &full.head, &full.body);
                            client.writer.frame(seq, full.head.encode()).await?;
                            self.forwarded = true;
                            client.writer.frame(seq, full.body).await?;
                        }
                        client.writer.end(seq).await?;

                        if by_close {
                            return Ok(Completion::EndedByClose);
                        }
                        let reusable = body.is_none()
                            && head.status != StatusCode::SWITCHING_PROTOCOLS
                            && head.is_keep_alive()
                            && keep_alive(request.version, &request.headers);
                        return Ok(if reusable { Completion::Reusable } else { Completion::Close });
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ProxyError::UpstreamClosed),
                },
                _ = client.cancel.cancelled() => return Err(ProxyError::ClientGone),
                _ = idle => return Err(ProxyError::Timeout("waiting for upstream response")),
            }
        }
    }

    fn bind(&mut self, client: &ClientLink) {
        if let Some(previous) = &self.bound {
            if previous.id != client.id {
                let _ = previous.events.send(RelayEvent::Detached {
                    connection: self.id,
                    key: self.key.clone(),
                });
            }
        }
        self.bound = Some(client.clone());
    }

    fn add_via(&self, head: &mut ResponseHead) {
        if let Ok(via) = HeaderValue::from_str(&self.via) {
            head.headers.append(VIA, via);
        }
    }

    fn notify_relayed(&mut self) {
        let Some(seq) = self.current.seq.take() else { return };
        self.current = CurrentRequest::default();
        if let Some(client) = &self.bound {
            let _ = client.events.send(RelayEvent::ResponseRelayed {
                connection: self.id,
                key: self.key.clone(),
                seq,
            });
        }
    }

    /// Close out a failed exchange in the client's writer.
    async fn fail_exchange(&mut self, seq: u64, error: &ProxyError) {
        let Some(client) = &self.bound else { return };
        match error {
            ProxyError::ClientGone => {
                tracing::debug!(upstream_id = %self.id, connection_id = %client.id, seq, "Client went away mid-exchange");
                return;
            }
            _ => tracing::warn!(
                upstream_id = %self.id,
                connection_id = %client.id,
                key = %self.key,
                seq,
                error = %error,
                "Upstream exchange failed"
            ),
        }
        if self.forwarded {
            let _ = client.writer.end(seq).await;
        } else {
            let _ = client.writer.respond(seq, bad_gateway(&self.via)).await;
        }
    }

    async fn close(mut self, exit: Exit) {
        self.handle.mark_disconnected();
        self.pool.remove(&self.key, &self.handle);
        self.shutdown.cancel();
        self.exchanges.close();
        let _ = self.writer.shutdown().await;

        let (closed_ends_body, reason) = match exit {
            Exit::Failed => (true, "response ended by close"),
            Exit::Finished => (false, "not reusable"),
            Exit::Abandoned => (false, "request body abandoned"),
            Exit::Idle(reason) => (false, reason),
        };
        let unanswered: Vec<u64> = self.current.seq.take().into_iter().collect();
        tracing::debug!(
            upstream_id = %self.id,
            key = %self.key,
            reason,
            unanswered = ?unanswered,
            method = ?self.current.method,
            target = %self.current.target,
            "Upstream connection closed"
        );

        if let Some(client) = &self.bound {
            let _ = client.events.send(RelayEvent::ChannelClosed {
                connection: self.id,
                key: self.key.clone(),
                unanswered,
                closed_ends_body,
            });
        }

        // Exchanges queued after the last one was taken never reached the wire.
        while let Ok(exchange) = self.exchanges.try_recv() {
            let Exchange { seq, client, .. } = exchange;
            tracing::debug!(upstream_id = %self.id, connection_id = %client.id, seq, "Answering exchange queued on a closing connection");
            let _ = client.writer.respond(seq, bad_gateway(&self.via)).await;
            let _ = client.events.send(RelayEvent::ChannelClosed {
                connection: self.id,
                key: self.key.clone(),
                unanswered: vec![seq],
                closed_ends_body: true,
            });
        }
    }
}

async fn next_body_frame(body: &mut Option<mpsc::Receiver<BodyFrame>>) -> Option<BodyFrame> {
    match body {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
