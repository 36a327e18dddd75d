//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_proxy::observability::ProxyStats;
use relay_proxy::{ProxyConfig, ProxyServer, Shutdown};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A request as an origin saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn target(&self) -> &str {
        self.request_line.split(' ').nth(1).unwrap_or("")
    }
}

/// Keep-alive origin that answers every request with `<name> <target>`.
#[derive(Clone)]
pub struct Origin {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl Origin {
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

pub async fn start_origin(name: &'static str) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = Origin {
        addr: listener.local_addr().unwrap(),
        accepts: Arc::new(AtomicUsize::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let state = origin.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            state.accepts.fetch_add(1, Ordering::SeqCst);
            let requests = state.requests.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                while let Some(request) = read_request(&mut reader).await {
                    let body = format!("{} {}", name, request.target());
                    requests.lock().unwrap().push(request);
                    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
                    if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    origin
}

/// Origin that answers with an HTTP/1.0 body delimited by closing the socket.
pub async fn start_close_delimited_origin(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                if read_request(&mut reader).await.is_some() {
                    let socket = reader.get_mut();
                    let _ = socket.write_all(format!("HTTP/1.0 200 OK\r\n\r\n{}", body).as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });
    addr
}

/// Plain TCP echo server, the far end of CONNECT tunnels.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Reads everything until the client half-closes, then sends it back and closes.
pub async fn start_echo_after_eof_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut received = Vec::new();
                if socket.read_to_end(&mut received).await.is_ok() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = socket.write_all(&received).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });
    addr
}

/// Keep-alive origin that accepts a single connection and then stops listening.
pub async fn start_single_connection_origin(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((socket, _)) = listener.accept().await else { return };
        drop(listener);
        let mut reader = BufReader::new(socket);
        while let Some(request) = read_request(&mut reader).await {
            let body = format!("{} {}", name, request.target());
            let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
            if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    });
    addr
}

/// Address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub stats: ProxyStats,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start a proxy on an ephemeral loopback port.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    start_server(ProxyServer::new(config)).await
}

pub async fn start_server(server: ProxyServer) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let stats = server.stats();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        server.run(listener, rx).await.unwrap();
    });
    TestProxy { addr, stats, shutdown }
}

pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.timeouts.connect_secs = 2;
    config
}

/// reqwest client that sends everything through `proxy`.
pub fn proxied_client(proxy: &TestProxy) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(proxy.url()).unwrap())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Read one request head and its body (Content-Length or chunked, de-chunked)
/// off an origin socket.
pub async fn read_request<R>(reader: &mut BufReader<R>) -> Option<RecordedRequest>
where
    R: AsyncRead + Unpin,
{
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.ok()? == 0 {
        return None;
    }
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    let body = if chunked {
        read_chunked_body(reader).await?
    } else {
        let length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.ok()?;
        body
    };
    Some(RecordedRequest {
        request_line: request_line.trim_end().to_string(),
        headers,
        body,
    })
}

async fn read_chunked_body<R>(reader: &mut BufReader<R>) -> Option<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let size = line.trim_end().split(';').next()?;
        let size = usize::from_str_radix(size.trim(), 16).ok()?;
        if size == 0 {
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await.ok()? == 0 || trailer.trim_end().is_empty() {
                    return Some(body);
                }
            }
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await.ok()?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.ok()?;
    }
}

/// A response read off a raw client socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read a response head plus its Content-Length body. Without a length
/// the body is whatever arrives before the socket closes.
pub async fn read_response<R>(reader: &mut BufReader<R>) -> RawResponse
where
    R: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await.unwrap();
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    let length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse::<usize>().unwrap());
    let mut body = Vec::new();
    match length {
        Some(length) => {
            body.resize(length, 0);
            reader.read_exact(&mut body).await.unwrap();
        }
        None => {
            reader.read_to_end(&mut body).await.unwrap();
        }
    }
    RawResponse {
        status_line: status_line.trim_end().to_string(),
        headers,
        body,
    }
}

/// Whether the peer closed `stream` within `wait`.
pub async fn closed_within<R>(reader: &mut BufReader<R>, wait: Duration) -> bool
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    matches!(tokio::time::timeout(wait, reader.read(&mut buf)).await, Ok(Ok(0)))
}

pub async fn connect(proxy: &TestProxy) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(proxy.addr).await.unwrap())
}
