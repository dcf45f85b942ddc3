//! Byte forwarding between a client and its upstream tunnel.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read size of each copy loop.
pub const FORWARD_BUFFER_SIZE: usize = 4096;

/// Bytes moved in each direction by [`relay_bidirectional`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes copied client → upstream.
    pub to_upstream: u64,
    /// Bytes copied upstream → client.
    pub to_client: u64,
}

/// Proxy data bidirectionally between the client and the upstream.
///
/// Runs two copy loops concurrently. The session ends as soon as either loop
/// ends (EOF, read error or write error): the other loop is cancelled and both
/// streams are dropped, closing the sockets.
pub async fn relay_bidirectional<C, U>(client: C, upstream: U) -> Transferred
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut transferred = Transferred::default();

    let client_to_upstream = copy_loop(
        &mut client_read,
        &mut upstream_write,
        &mut transferred.to_upstream,
    );
    let upstream_to_client = copy_loop(
        &mut upstream_read,
        &mut client_write,
        &mut transferred.to_client,
    );

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!(error = %e, "client->upstream copy failed");
            } else {
                debug!("client closed connection");
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!(error = %e, "upstream->client copy failed");
            } else {
                debug!("upstream closed connection");
            }
        }
    }

    transferred
}

/// Copies until EOF or error, counting bytes written.
async fn copy_loop<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (client_side, mut client_peer) = duplex(64 * 1024);
        let (upstream_side, mut upstream_peer) = duplex(64 * 1024);

        let session = tokio::spawn(relay_bidirectional(client_side, upstream_side));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        let transferred = session.await.unwrap();
        assert_eq!(transferred.to_upstream, 4);
        assert_eq!(transferred.to_client, 5);
    }

    #[tokio::test]
    async fn test_one_side_closing_ends_session() {
        let (client_side, client_peer) = duplex(1024);
        let (upstream_side, mut upstream_peer) = duplex(1024);

        let session = tokio::spawn(relay_bidirectional(client_side, upstream_side));

        // Client hangs up while the upstream stays open.
        drop(client_peer);
        tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("session should end when one side closes")
            .unwrap();

        // The upstream stream was dropped by the session, so the peer sees EOF.
        let mut buf = [0u8; 8];
        let n = upstream_peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_large_payload_is_chunked() {
        let (client_side, mut client_peer) = duplex(1024);
        let (upstream_side, mut upstream_peer) = duplex(1024);

        let session = tokio::spawn(relay_bidirectional(client_side, upstream_side));

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&payload).await.unwrap();
            client_peer
        });

        let mut received = vec![0u8; expected.len()];
        upstream_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let transferred = session.await.unwrap();
        assert_eq!(transferred.to_upstream, 20_000);
    }
}
