//! HTTP proxy front-end.
//!
//! Accepts plain proxied HTTP requests and CONNECT tunnels, one hyper
//! connection task per client. The listener is bound eagerly so a bind
//! failure surfaces before the pool reports itself up.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::balancer::handler::ProxyHandler;
use crate::error::{PoolError, Result};

/// Front-end proxy server
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Bind the front-end listener.
    pub async fn bind(listen: SocketAddr, handler: Arc<ProxyHandler>) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| PoolError::ListenerBind(format!("{}: {}", listen, e)))?;
        info!("front-end proxy listening on {}", listen);
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(PoolError::Io)
    }

    /// Serve until the shutdown signal flips, then stop accepting and let
    /// in-flight requests drain for up to `drain_grace`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, drain_grace: Duration) {
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = self.handler.clone();
                            connections.spawn(async move {
                                if let Err(e) = serve_connection(stream, handler).await {
                                    debug!("connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }
                // Reap finished connection tasks as we go.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        if !connections.is_empty() {
            info!("draining {} in-flight connections", connections.len());
            let _ = timeout(drain_grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
        }
        connections.shutdown().await;
        info!("front-end proxy stopped");
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<ProxyHandler>) -> Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| PoolError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::handler::HandlerConfig;
    use crate::balancer::pool::BackendPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Clone, Copy)]
    enum StubMode {
        /// Complete the SOCKS handshake, then answer any HTTP request with
        /// a 200 carrying this body.
        HttpOk(&'static str),
        /// Complete the SOCKS handshake, then echo bytes until EOF.
        Echo,
        /// Reject the CONNECT request with a general failure reply.
        RefuseConnect,
    }

    /// Minimal SOCKS5 no-auth server standing in for a worker.
    async fn spawn_socks_stub(mode: StubMode) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve_stub(&mut stream, mode).await;
                });
            }
        });

        (addr, connections)
    }

    async fn serve_stub(stream: &mut TcpStream, mode: StubMode) -> std::io::Result<()> {
        // Method negotiation.
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;
        stream.write_all(&[0x05, 0x00]).await?;

        // CONNECT request: header, address by type, port.
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        match request[3] {
            0x01 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await?;
            }
            0x04 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
            }
            _ => return Ok(()),
        }
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;

        if matches!(mode, StubMode::RefuseConnect) {
            stream
                .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;

        match mode {
            StubMode::HttpOk(body) => {
                read_http_headers(stream).await?;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await?;
                stream.flush().await?;
            }
            StubMode::Echo => {
                let mut buf = [0u8; 1024];
                loop {
                    let n = stream.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&buf[..n]).await?;
                }
            }
            StubMode::RefuseConnect => unreachable!(),
        }
        Ok(())
    }

    async fn read_http_headers(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if collected.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        Ok(collected)
    }

    async fn start_proxy(
        backends: Arc<BackendPool>,
        retry_attempts: u32,
    ) -> (SocketAddr, watch::Sender<bool>, Arc<ProxyHandler>) {
        let handler = Arc::new(ProxyHandler::new(
            backends,
            HandlerConfig {
                retry_attempts,
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(5),
            },
        ));
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), handler.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx, Duration::from_secs(1)));
        (addr, shutdown_tx, handler)
    }

    /// One proxied GET over a fresh connection; returns (status, body).
    async fn proxied_get(proxy: SocketAddr, url: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
            url
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw).to_string();

        let status = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[tokio::test]
    async fn test_round_robin_across_three_backends() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        for (id, body) in ["b0", "b1", "b2"].iter().enumerate() {
            let (addr, _) = spawn_socks_stub(StubMode::HttpOk(body)).await;
            pool.add(id, addr);
        }

        let (proxy, _shutdown, handler) = start_proxy(pool.clone(), 3).await;

        let mut bodies = Vec::new();
        for _ in 0..6 {
            let (status, body) = proxied_get(proxy, "http://example.test/").await;
            assert_eq!(status, 200);
            bodies.push(body);
        }
        assert_eq!(bodies, vec!["b0", "b1", "b2", "b0", "b1", "b2"]);

        assert_eq!(handler.requests_total(), 6);
        assert_eq!(handler.requests_failed(), 0);
        for stats in pool.stats() {
            assert_eq!(stats.success_count, 2);
            assert_eq!(stats.failure_count, 0);
        }
    }

    #[tokio::test]
    async fn test_failover_on_dial_failure() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));

        let (b0, _) = spawn_socks_stub(StubMode::HttpOk("b0")).await;
        // Reserve a port and close it so dialing backend 1 is refused.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let (b2, _) = spawn_socks_stub(StubMode::HttpOk("b2")).await;

        pool.add(0, b0);
        pool.add(1, dead_addr);
        pool.add(2, b2);

        let (proxy, _shutdown, _handler) = start_proxy(pool.clone(), 3).await;

        let (status, body) = proxied_get(proxy, "http://example.test/").await;
        assert_eq!((status, body.as_str()), (200, "b0"));

        // This pick lands on the dead backend and fails over.
        let (status, body) = proxied_get(proxy, "http://example.test/").await;
        assert_eq!((status, body.as_str()), (200, "b2"));

        let failed = pool
            .stats()
            .into_iter()
            .find(|s| s.worker_id == 1)
            .unwrap();
        assert_eq!(failed.failure_count, 1);
        assert!(failed.cooldown_remaining_ms > 0);

        // The cooling backend is skipped without disturbing rotation.
        let (_, body) = proxied_get(proxy, "http://example.test/").await;
        assert_eq!(body, "b0");
        let (_, body) = proxied_get(proxy, "http://example.test/").await;
        assert_eq!(body, "b2");
    }

    #[tokio::test]
    async fn test_connect_tunnel_echoes_bytes() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        let (addr, _) = spawn_socks_stub(StubMode::Echo).await;
        pool.add(0, addr);

        let (proxy, _shutdown, _handler) = start_proxy(pool.clone(), 3).await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
            .await
            .unwrap();

        // Read the confirmation line and headers.
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before 200");
            collected.extend_from_slice(&buf[..n]);
            if collected.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&collected);
        assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);

        // Bytes written into the tunnel come back identically.
        let payload = b"tunnel-payload-0123456789";
        stream.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, payload);
    }

    #[tokio::test]
    async fn test_single_backend_in_cooldown_yields_502() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        let (addr, connections) = spawn_socks_stub(StubMode::RefuseConnect).await;
        pool.add(0, addr);

        let (proxy, _shutdown, handler) = start_proxy(pool.clone(), 2).await;

        // First request fails at SOCKS negotiation and cools the backend.
        let (status, _) = proxied_get(proxy, "http://example.test/").await;
        assert_eq!(status, 502);

        // Second request finds no eligible backend and never dials.
        let (status, _) = proxied_get(proxy, "http://example.test/").await;
        assert_eq!(status, 502);

        assert_eq!(connections.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats[0].failure_count, 1);
        assert_eq!(handler.requests_failed(), 2);
    }

    #[tokio::test]
    async fn test_origin_form_request_is_rejected() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        let (addr, _) = spawn_socks_stub(StubMode::HttpOk("x")).await;
        pool.add(0, addr);

        let (proxy, _shutdown, _handler) = start_proxy(pool, 3).await;

        let (status, _) = proxied_get(proxy, "/origin-form").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_connect_without_port_is_rejected() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        let (proxy, _shutdown, _handler) = start_proxy(pool, 3).await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(
                b"CONNECT example.test HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 400"), "got: {}", text);
    }

    #[tokio::test]
    async fn test_connect_with_no_backend_yields_502() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        let (proxy, _shutdown, _handler) = start_proxy(pool, 3).await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(
                b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 502"), "got: {}", text);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listener_bind_error() {
        let pool = Arc::new(BackendPool::new(Duration::from_secs(30), false));
        let handler = Arc::new(ProxyHandler::new(
            pool,
            HandlerConfig {
                retry_attempts: 1,
                connect_timeout: Duration::from_secs(1),
                request_timeout: Duration::from_secs(1),
            },
        ));

        let first = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), handler.clone())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let err = ProxyServer::bind(taken, handler).await.unwrap_err();
        assert!(matches!(err, PoolError::ListenerBind(_)));
        assert_eq!(err.exit_code(), 3);
    }
}
