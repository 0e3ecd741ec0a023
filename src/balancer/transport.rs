//! SOCKS5 outbound dialing.
//!
//! Minimal no-auth CONNECT client over `tokio-socks`; the worker's SOCKS
//! endpoint carries every outbound connection the balancer makes.

use std::net::SocketAddr;
use std::time::Duration;

use hyper::Uri;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{PoolError, Result};

/// Open a TCP stream to `target_host:target_port` tunneled through the
/// SOCKS5 endpoint at `socks_endpoint`.
pub async fn connect_socks5(
    socks_endpoint: SocketAddr,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    debug!(
        "dialing {}:{} via socks5 {}",
        target_host, target_port, socks_endpoint
    );

    let stream = timeout(
        connect_timeout,
        Socks5Stream::connect(socks_endpoint, (target_host, target_port)),
    )
    .await
    .map_err(|_| PoolError::UpstreamTimeout)?
    .map_err(map_socks_error)?;

    Ok(stream.into_inner())
}

fn map_socks_error(err: tokio_socks::Error) -> PoolError {
    match err {
        // Could not reach the worker's SOCKS port at all.
        tokio_socks::Error::Io(io) => PoolError::BackendDial(io.to_string()),
        // Reached it, but the handshake or CONNECT reply failed.
        other => PoolError::SocksNegotiation(other.to_string()),
    }
}

/// Host and port of an absolute proxy URI.
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| {
            PoolError::ClientProtocol("proxy requests require an absolute URI".into())
        })?
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

/// Host and port of a CONNECT authority; the port is required.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port_str) = authority.rsplit_once(':').ok_or_else(|| {
        PoolError::ClientProtocol(format!("CONNECT target {:?} is missing a port", authority))
    })?;

    if host.is_empty() {
        return Err(PoolError::ClientProtocol(
            "CONNECT target is missing a host".into(),
        ));
    }

    let port = port_str
        .parse::<u16>()
        .map_err(|_| PoolError::ClientProtocol(format!("invalid CONNECT port {:?}", port_str)))?;

    Ok((host.to_string(), port))
}
