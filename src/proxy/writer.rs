//! Ordered writer for the client side of a connection.
//!
//! # Responsibilities
//! - Serialize every write to the client socket through one task
//! - Put responses back in request order: a response for sequence number
//!   `n` is written only after responses `0..n` are complete
//! - Hand the raw socket back for CONNECT tunnelling
//!
//! # Design Decisions
//! - Frames for a later slot are buffered in a `BTreeMap` keyed by sequence.
//!   Once a slot holds more than `SLOT_BUFFER_LIMIT` bytes its producer is
//!   not acknowledged until the slot reaches the socket
//! - `End` for a slot that already ended is ignored, so relays and the
//!   client handler may both end the same slot
//! - A write error ends the task; senders observe a closed channel

use std::collections::BTreeMap;
use std::sync::OnceLock;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ProxyError;
use crate::net::connection::ConnectionId;

/// Write half of a client connection, type-erased over plain TCP and TLS.
pub type ClientSink = Box<dyn AsyncWrite + Send + Unpin>;

const WRITER_QUEUE: usize = 256;

/// Bytes a not-yet-writable slot may buffer before its producer waits.
pub const SLOT_BUFFER_LIMIT: usize = 64 * 1024;

pub(crate) enum WriterCommand {
    Frame {
        seq: u64,
        data: Bytes,
        ack: Option<oneshot::Sender<()>>,
    },
    End { seq: u64 },
    Complete { seq: u64, data: Bytes },
    Close,
    Detach { after: u64, reply: oneshot::Sender<ClientSink> },
}

/// Cloneable handle to a client's writer task.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    tx: mpsc::Sender<WriterCommand>,
}

impl ResponseWriter {
    /// Start the writer task for `sink`.
    pub fn spawn(connection: ConnectionId, sink: ClientSink) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        let writer = OrderedWriter {
            connection,
            sink,
            next: 0,
            pending: BTreeMap::new(),
            detach: None,
        };
        let task = tokio::spawn(writer.run(rx));
        (Self { tx }, task)
    }

    /// Append bytes to the response in slot `seq`. Waits while an earlier
    /// slot is still open and `seq` already buffers more than `SLOT_BUFFER_LIMIT`.
    pub async fn frame(&self, seq: u64, data: Bytes) -> Result<(), ProxyError> {
        let (ack, acked) = oneshot::channel();
        self.send(WriterCommand::Frame {
            seq,
            data,
            ack: Some(ack),
        })
        .await?;
        acked.await.map_err(|_| ProxyError::ClientGone)
    }

    /// Mark the response in slot `seq` complete.
    pub async fn end(&self, seq: u64) -> Result<(), ProxyError> {
        self.send(WriterCommand::End { seq }).await
    }

    /// Write a whole response into slot `seq` and complete it.
    pub async fn respond(&self, seq: u64, data: Bytes) -> Result<(), ProxyError> {
        self.send(WriterCommand::Complete { seq, data }).await
    }

    /// Flush what can be written in order, then shut the socket down.
    pub async fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close).await;
    }

    /// Take the socket back once every slot up to and including `after` is written.
    pub async fn detach(&self, after: u64) -> Option<ClientSink> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WriterCommand::Detach { after, reply }).await.ok()?;
        rx.await.ok()
    }

    async fn send(&self, command: WriterCommand) -> Result<(), ProxyError> {
        self.tx.send(command).await.map_err(|_| ProxyError::ClientGone)
    }
}

/// Lets a collaborator (cache, authorization) answer one request.
///
/// The answer is held here; the client handler writes it into the request's
/// slot once the collaborator returns.
#[derive(Debug, Default)]
pub struct ClientResponder {
    response: OnceLock<Bytes>,
}

impl ClientResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `response` (a complete serialized message) as the answer.
    /// Only the first call has an effect.
    pub fn respond(&self, response: Bytes) -> bool {
        self.response.set(response).is_ok()
    }

    pub fn into_response(self) -> Option<Bytes> {
        self.response.into_inner()
    }
}

#[derive(Default)]
struct Buffered {
    chunks: Vec<Bytes>,
    bytes: usize,
    complete: bool,
    /// Producers held back until this slot is written.
    parked: Vec<oneshot::Sender<()>>,
}

struct OrderedWriter {
    connection: ConnectionId,
    sink: ClientSink,
    /// Slot currently allowed to write.
    next: u64,
    pending: BTreeMap<u64, Buffered>,
    detach: Option<(u64, oneshot::Sender<ClientSink>)>,
}

impl OrderedWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>) {
        while let Some(command) = rx.recv().await {
            let result = match command {
                WriterCommand::Frame { seq, data, ack } => self.frame(seq, data, ack).await,
                WriterCommand::End { seq } => self.end(seq).await,
                WriterCommand::Complete { seq, data } => match self.frame(seq, data, None).await {
                    Ok(()) => self.end(seq).await,
                    Err(e) => Err(e),
                },
                WriterCommand::Close => break,
                WriterCommand::Detach { after, reply } => {
                    self.detach = Some((after, reply));
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %self.connection, error = %e, "Client write failed");
                return;
            }
            match self.detach.take() {
                Some((after, reply)) if self.next > after => {
                    tracing::debug!(connection_id = %self.connection, "Client socket detached for tunnelling");
                    let _ = reply.send(self.sink);
                    return;
                }
                other => self.detach = other,
            }
        }
        let _ = self.sink.shutdown().await;
        tracing::trace!(connection_id = %self.connection, "Client writer finished");
    }

    async fn frame(&mut self, seq: u64, data: Bytes, ack: Option<oneshot::Sender<()>>) -> std::io::Result<()> {
        if seq < self.next || data.is_empty() {
            release(ack);
            return Ok(());
        }
        if seq == self.next {
            self.sink.write_all(&data).await?;
            self.sink.flush().await?;
            release(ack);
            return Ok(());
        }
        let slot = self.pending.entry(seq).or_default();
        slot.bytes += data.len();
        slot.chunks.push(data);
        match ack {
            Some(ack) if slot.bytes > SLOT_BUFFER_LIMIT => {
                tracing::trace!(connection_id = %self.connection, seq, buffered = slot.bytes, "Slot buffer full");
                slot.parked.push(ack);
            }
            other => release(other),
        }
        Ok(())
    }

    async fn end(&mut self, seq: u64) -> std::io::Result<()> {
        if seq < self.next {
            return Ok(());
        }
        if seq > self.next {
            self.pending.entry(seq).or_default().complete = true;
            return Ok(());
        }
        self.next += 1;
        while let Some(buffered) = self.pending.remove(&self.next) {
            for chunk in &buffered.chunks {
                self.sink.write_all(chunk).await?;
            }
            buffered.parked.into_iter().for_each(|ack| release(Some(ack)));
            if !buffered.complete {
                break;
            }
            self.next += 1;
        }
        self.sink.flush().await
    }
}

fn release(ack: Option<oneshot::Sender<()>>) {
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: tokio::io::DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn restores_request_order() {
        let (client, server) = tokio::io::duplex(1024);
        let (writer, task) = ResponseWriter::spawn(ConnectionId::next(), Box::new(server));

        writer.frame(1, Bytes::from_static(b"B1")).await.unwrap();
        writer.respond(2, Bytes::from_static(b"C")).await.unwrap();
        writer.frame(0, Bytes::from_static(b"A1")).await.unwrap();
        writer.end(1).await.unwrap();
        writer.frame(0, Bytes::from_static(b"A2")).await.unwrap();
        writer.end(0).await.unwrap();
        writer.close().await;
        task.await.unwrap();

        assert_eq!(read_all(client).await, b"A1A2B1C");
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let (client, server) = tokio::io::duplex(1024);
        let (writer, task) = ResponseWriter::spawn(ConnectionId::next(), Box::new(server));

        writer.respond(0, Bytes::from_static(b"first")).await.unwrap();
        writer.end(0).await.unwrap();
        writer.frame(0, Bytes::from_static(b"late")).await.unwrap();
        writer.respond(1, Bytes::from_static(b"second")).await.unwrap();
        writer.close().await;
        task.await.unwrap();

        assert_eq!(read_all(client).await, b"firstsecond");
    }

    #[tokio::test]
    async fn detach_waits_for_earlier_slots() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (writer, _task) = ResponseWriter::spawn(ConnectionId::next(), Box::new(server));

        writer.respond(1, Bytes::from_static(b"200")).await.unwrap();
        let detached = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.detach(1).await })
        };
        writer.respond(0, Bytes::from_static(b"zero;")).await.unwrap();

        let mut sink = detached.await.unwrap().expect("sink handed back");
        sink.write_all(b"raw").await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"zero;200raw");
    }

    #[tokio::test]
    async fn later_slot_over_limit_waits_for_its_turn() {
        let (client, server) = tokio::io::duplex(4 * SLOT_BUFFER_LIMIT);
        let (writer, task) = ResponseWriter::spawn(ConnectionId::next(), Box::new(server));

        writer.frame(1, Bytes::from_static(b"small")).await.unwrap();
        let blocked = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.frame(1, Bytes::from(vec![b'x'; SLOT_BUFFER_LIMIT])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        writer.respond(0, Bytes::from_static(b"zero;")).await.unwrap();
        blocked.await.unwrap().unwrap();
        writer.end(1).await.unwrap();
        writer.close().await;
        task.await.unwrap();

        let out = read_all(client).await;
        assert!(out.starts_with(b"zero;small"));
        assert_eq!(out.len(), 10 + SLOT_BUFFER_LIMIT);
    }

    #[tokio::test]
    async fn many_small_responses_fit_the_queue() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (writer, task) = ResponseWriter::spawn(ConnectionId::next(), Box::new(server));

        for seq in (1..=2 * WRITER_QUEUE as u64).rev() {
            writer.respond(seq, Bytes::from_static(b".")).await.unwrap();
        }
        writer.respond(0, Bytes::from_static(b"!")).await.unwrap();
        writer.close().await;
        task.await.unwrap();

        let out = read_all(client).await;
        assert_eq!(out.len(), 1 + 2 * WRITER_QUEUE);
        assert_eq!(out[0], b'!');
    }

    #[test]
    fn responder_answers_once() {
        let responder = ClientResponder::new();

        assert!(responder.respond(Bytes::from_static(b"cached")));
        assert!(!responder.respond(Bytes::from_static(b"again")));
        assert_eq!(responder.into_response(), Some(Bytes::from_static(b"cached")));
        assert_eq!(ClientResponder::new().into_response(), None);
    }
}
