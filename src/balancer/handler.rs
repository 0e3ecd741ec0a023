//! Per-request proxy logic: backend selection, retry across alternates,
//! plain HTTP forwarding, and CONNECT tunneling.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::balancer::pool::{Backend, BackendPool};
use crate::balancer::{transport, tunnel};
use crate::error::{PoolError, Result};

/// Response body type: either an upstream stream or a local buffer.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers meaningful only hop-to-hop; stripped in both directions.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Configuration for the request handler
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Maximum backends tried per client request
    pub retry_attempts: u32,
    /// Timeout for dialing a backend and completing the SOCKS handshake
    pub connect_timeout: Duration,
    /// Timeout for the upstream request/response exchange
    pub request_timeout: Duration,
}

/// Proxy request handler shared by all client connections.
#[derive(Debug)]
pub struct ProxyHandler {
    backends: Arc<BackendPool>,
    config: HandlerConfig,
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
}

impl ProxyHandler {
    pub fn new(backends: Arc<BackendPool>, config: HandlerConfig) -> Self {
        Self {
            backends,
            config,
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    /// Handle one client request; errors become error responses here.
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let result = if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                error_response(&e)
            }
        }
    }

    /// CONNECT tunneling: open a SOCKS5 CONNECT through a backend, confirm
    /// with `200 Connection Established`, then byte-copy both directions.
    async fn handle_connect(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| PoolError::ClientProtocol("CONNECT requires host:port".into()))?;
        let (host, port) = transport::parse_authority(&authority)?;

        debug!("CONNECT {}:{}", host, port);

        let (backend, upstream) = self.dial_with_retry(&host, port).await?;
        // The tunnel is confirmed below; from here on failures belong to
        // the tunnel itself, not to backend selection.
        self.backends.mark_success(&backend);
        info!(
            worker = backend.worker_id,
            "CONNECT tunnel to {}:{} established", host, port
        );

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    if let Err(e) = tunnel::copy_bidirectional(client, upstream).await {
                        debug!("tunnel error: {}", e);
                    }
                }
                Err(e) => debug!("connection upgrade failed: {}", e),
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .expect("static response cannot fail to build"))
    }

    /// Plain HTTP proxying of an absolute-URI request.
    async fn handle_http(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let uri = req.uri().clone();
        let (host, port) = transport::parse_target(&uri)?;
        let relative_target = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let (parts, body) = req.into_parts();
        // Buffered so the request can be replayed against an alternate
        // backend.
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| PoolError::ClientProtocol(format!("failed to read body: {}", e)))?
            .to_bytes();

        let mut exclude = HashSet::new();
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let Some(backend) = self.backends.pick(&exclude) else {
                break;
            };

            debug!(
                worker = backend.worker_id,
                "forwarding {} {} (attempt {}/{})", parts.method, uri, attempt, attempts
            );

            match self
                .forward_once(&backend, &parts, &body_bytes, &host, port, &relative_target)
                .await
            {
                Ok(response) => {
                    self.backends.mark_success(&backend);
                    return Ok(response.map(|b| b.boxed()));
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        worker = backend.worker_id,
                        "attempt {}/{} failed: {}", attempt, attempts, e
                    );
                    self.backends.mark_failure(&backend);
                    exclude.insert(backend.worker_id);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(PoolError::NoBackendAvailable))
    }

    /// One forwarding attempt through one backend. Every error returned
    /// here is connection-level and happened before any response byte
    /// reached the client.
    async fn forward_once(
        &self,
        backend: &Backend,
        parts: &http::request::Parts,
        body: &Bytes,
        host: &str,
        port: u16,
        relative_target: &str,
    ) -> Result<Response<Incoming>> {
        let stream = self.dial(backend.endpoint, host, port).await?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|e| PoolError::BackendDial(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection ended: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(relative_target);
        for (name, value) in &parts.headers {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        if !parts.headers.contains_key(HOST) {
            let host_value = if port == 80 {
                host.to_string()
            } else {
                format!("{}:{}", host, port)
            };
            builder = builder.header(HOST, host_value);
        }

        let request = builder
            .body(Full::new(body.clone()))
            .map_err(|e| PoolError::ClientProtocol(format!("failed to build request: {}", e)))?;

        let mut response = timeout(self.config.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| PoolError::UpstreamTimeout)?
            .map_err(|e| PoolError::BackendDial(format!("request failed: {}", e)))?;

        for header in HOP_BY_HOP_HEADERS {
            response.headers_mut().remove(*header);
        }

        Ok(response)
    }

    /// Pick-and-dial loop shared by CONNECT; failed backends are marked
    /// and excluded before the next pick.
    async fn dial_with_retry(&self, host: &str, port: u16) -> Result<(Arc<Backend>, TcpStream)> {
        let mut exclude = HashSet::new();
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let Some(backend) = self.backends.pick(&exclude) else {
                break;
            };

            match self.dial(backend.endpoint, host, port).await {
                Ok(stream) => return Ok((backend, stream)),
                Err(e) if e.is_retryable() => {
                    warn!(
                        worker = backend.worker_id,
                        "dial attempt {}/{} failed: {}", attempt, attempts, e
                    );
                    self.backends.mark_failure(&backend);
                    exclude.insert(backend.worker_id);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(PoolError::NoBackendAvailable))
    }

    async fn dial(&self, endpoint: SocketAddr, host: &str, port: u16) -> Result<TcpStream> {
        transport::connect_socks5(endpoint, host, port, self.config.connect_timeout).await
    }
}

/// Map an error to the client-facing status code.
fn error_response(error: &PoolError) -> Response<ProxyBody> {
    let status = match error {
        PoolError::ClientProtocol(_) => StatusCode::BAD_REQUEST,
        PoolError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };

    debug!("request failed with {}: {}", status, error);

    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(error.to_string()))
        .expect("static response cannot fail to build")
}
