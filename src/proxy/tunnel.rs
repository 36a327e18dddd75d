//! Byte relay after a successful CONNECT.
//!
//! Bytes already buffered on either side are written first, then both
//! directions are copied with `copy_bidirectional`. A side that reaches EOF
//! has its peer's write half shut down after flushing, while the opposite
//! direction keeps flowing until it closes too.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::net::connection::ConnectionId;
use crate::proxy::writer::ClientSink;

/// Both ends of an established tunnel.
pub struct Tunnel<R> {
    pub connection: ConnectionId,
    pub client_read: R,
    pub client_write: ClientSink,
    /// Bytes the client sent after the CONNECT head.
    pub client_leftover: Bytes,
    pub upstream: TcpStream,
    /// Bytes the upstream sent after its CONNECT response head.
    pub upstream_leftover: Bytes,
}

impl<R> Tunnel<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn run(self) -> std::io::Result<()> {
        let Tunnel {
            connection,
            client_read,
            mut client_write,
            client_leftover,
            mut upstream,
            upstream_leftover,
        } = self;

        if !client_leftover.is_empty() {
            upstream.write_all(&client_leftover).await?;
        }
        if !upstream_leftover.is_empty() {
            client_write.write_all(&upstream_leftover).await?;
            client_write.flush().await?;
        }

        let mut client = tokio::io::join(client_read, client_write);
        let copied = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        let _ = client.shutdown().await;
        let _ = upstream.shutdown().await;

        let (up, down) = copied?;
        tracing::debug!(
            connection_id = %connection,
            client_to_upstream = up + client_leftover.len() as u64,
            upstream_to_client = down + upstream_leftover.len() as u64,
            "Tunnel closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relays_leftovers_then_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let upstream = TcpStream::connect(addr).await.unwrap();
        let (client_side, proxy_side) = tokio::io::duplex(1024);
        let (proxy_read, proxy_write) = tokio::io::split(proxy_side);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);

        let tunnel = Tunnel {
            connection: ConnectionId::next(),
            client_read: proxy_read,
            client_write: Box::new(proxy_write),
            client_leftover: Bytes::from_static(b"he"),
            upstream,
            upstream_leftover: Bytes::from_static(b">"),
        };
        let task = tokio::spawn(tunnel.run());

        client_write.write_all(b"llo").await.unwrap();
        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b">hello");

        // The upstream is done; the tunnel ends once the client closes as well.
        client_write.shutdown().await.unwrap();
        echo.await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn keeps_relaying_after_client_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stream.write_all(b"reply").await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });

        let upstream = TcpStream::connect(addr).await.unwrap();
        let (client_side, proxy_side) = tokio::io::duplex(1024);
        let (proxy_read, proxy_write) = tokio::io::split(proxy_side);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);

        let tunnel = Tunnel {
            connection: ConnectionId::next(),
            client_read: proxy_read,
            client_write: Box::new(proxy_write),
            client_leftover: Bytes::new(),
            upstream,
            upstream_leftover: Bytes::new(),
        };
        let task = tokio::spawn(tunnel.run());

        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();
        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"reply");

        assert_eq!(server.await.unwrap(), b"ping");
        task.await.unwrap().unwrap();
    }
}
