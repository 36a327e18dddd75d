//! Handle to a live upstream connection.
//!
//! The socket itself is owned by the relay task; everything else holds an
//! [`UpstreamHandle`] that can queue one exchange at a time, report
//! connectedness and ask the task to close.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::net::connection::ConnectionId;
use crate::relay::Exchange;

#[derive(Clone)]
pub struct UpstreamHandle {
    id: ConnectionId,
    key: Arc<str>,
    exchanges: mpsc::Sender<Exchange>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl UpstreamHandle {
    /// New handle plus the receiving end the relay task drains.
    pub fn new(id: ConnectionId, key: &str) -> (Self, mpsc::Receiver<Exchange>) {
        let (exchanges, rx) = mpsc::channel(1);
        let handle = Self {
            id,
            key: Arc::from(key),
            exchanges,
            connected: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Destination `host:port` this connection talks to.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.shutdown.is_cancelled() && !self.exchanges.is_closed()
    }

    /// Ask the relay task to close the socket.
    pub fn close(&self) {
        self.mark_disconnected();
        self.shutdown.cancel();
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue an exchange. The exchange is handed back if the relay task is gone.
    pub async fn dispatch(&self, exchange: Exchange) -> Result<(), Box<Exchange>> {
        if !self.is_connected() {
            return Err(Box::new(exchange));
        }
        self.exchanges.send(exchange).await.map_err(|e| Box::new(e.0))
    }
}

impl fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish()
    }
}
