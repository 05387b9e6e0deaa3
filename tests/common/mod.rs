//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use portico::config::{parse_config, ConfigStore};
use portico::lifecycle::Shutdown;
use portico::observability::NullRecorder;
use portico::plugin::PluginRegistry;
use portico::proxy::BufferPool;
use portico::router::AppState;
use portico::server::Server;
use portico::transport::TransportCache;

/// Client that ignores system proxy settings; tests must hit the local
/// gateway directly.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// A running gateway plus the handles tests need to steer it.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: Arc<ConfigStore>,
    // Dropping the coordinator would trigger graceful shutdown.
    _shutdown: Arc<Shutdown>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Start a gateway from raw YAML with no plugins.
pub async fn start_gateway(yaml: &str) -> TestGateway {
    start_gateway_with_plugins(yaml, PluginRegistry::empty()).await
}

/// Start a gateway from raw YAML with a prepared plugin registry.
pub async fn start_gateway_with_plugins(yaml: &str, plugins: PluginRegistry) -> TestGateway {
    let snapshot = parse_config(yaml).expect("test config parses");
    let transports = Arc::new(TransportCache::new());
    let store = Arc::new(ConfigStore::new(snapshot, transports));

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        plugins: Arc::new(plugins),
        metrics: Arc::new(NullRecorder),
        buffers: Arc::new(BufferPool::new()),
        exposition: None,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Shutdown::new());

    let server = Server::new(state);
    let server_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    // Give the listener a beat to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestGateway {
        addr,
        store,
        _shutdown: shutdown,
    }
}

/// Start a backend that answers every request with the same raw bytes,
/// optionally delaying before it responds.
pub async fn start_raw_backend(response: Vec<u8>, delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let response = response.clone();
                    tokio::spawn(async move {
                        read_request_head(&mut socket).await;
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let _ = socket.write_all(&response).await;
                        let _ = socket.flush().await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a backend that streams a chunked response, flushing each chunk
/// with a pause in between.
pub async fn start_chunked_backend(
    content_type: &'static str,
    chunks: Vec<Vec<u8>>,
    pause: Duration,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let chunks = chunks.clone();
                    tokio::spawn(async move {
                        read_request_head(&mut socket).await;
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
                            content_type
                        );
                        if socket.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        for chunk in chunks {
                            let framed = format!("{:x}\r\n", chunk.len());
                            if socket.write_all(framed.as_bytes()).await.is_err() {
                                return;
                            }
                            if socket.write_all(&chunk).await.is_err() {
                                return;
                            }
                            if socket.write_all(b"\r\n").await.is_err() {
                                return;
                            }
                            let _ = socket.flush().await;
                            if !pause.is_zero() {
                                tokio::time::sleep(pause).await;
                            }
                        }
                        let _ = socket.write_all(b"0\r\n\r\n").await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Build the canonical simple response: status 200, explicit
/// Content-Length, Connection: close.
pub fn http_response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1024];
    loop {
        match socket.read(&mut byte).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&byte[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
