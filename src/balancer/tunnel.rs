//! Bidirectional byte copying for CONNECT tunnels.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;

/// Copy data both ways between `client` and `upstream` until either side
/// closes. Returns (bytes client→upstream, bytes upstream→client).
pub async fn copy_bidirectional<C, U>(client: C, upstream: U) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };

    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);

    let bytes_sent = sent.unwrap_or_else(|e| {
        debug!("client to upstream copy ended: {}", e);
        0
    });
    let bytes_received = received.unwrap_or_else(|e| {
        debug!("upstream to client copy ended: {}", e);
        0
    });

    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "tunnel closed"
    );

    Ok((bytes_sent, bytes_received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_copy_bidirectional_moves_bytes_both_ways() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut upstream_peer, upstream) = tokio::io::duplex(1024);

        let copy_handle =
            tokio::spawn(async move { copy_bidirectional(client, upstream).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();

        upstream_peer.write_all(b"hello from upstream").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = upstream_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from upstream");

        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), copy_handle)
            .await
            .expect("copy timed out")
            .unwrap()
            .unwrap();
        assert_eq!(sent, b"hello from client".len() as u64);
        assert_eq!(received, b"hello from upstream".len() as u64);
    }
}
