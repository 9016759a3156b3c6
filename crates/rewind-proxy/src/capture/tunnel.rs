//! Record-mode pass-through
//!
//! Accepts clients, connects each one to the upstream service, and copies
//! bytes both ways unchanged while feeding them to the connection's tracker.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::factory::TrackerFactory;
use super::tracker::ConnId;

/// Which side a chunk of bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to upstream: the request side
    ClientToUpstream,
    /// Upstream to client: the response side
    UpstreamToClient,
}

/// Accept clients on `listener` and tunnel them to `upstream` until shutdown
pub async fn run_capture_tunnel(
    listener: TcpListener,
    upstream: String,
    factory: Arc<TrackerFactory>,
    buffer_size: usize,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("Capture tunnel listening on {} -> {}", local_addr, upstream);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        debug!("New capture connection from {}", client_addr);
                        let upstream = upstream.clone();
                        let factory = factory.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, client_addr, &upstream, factory, buffer_size).await
                            {
                                debug!("Capture connection {} ended with error: {}", client_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = &mut shutdown_rx => {
                debug!("Capture tunnel shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    client: TcpStream,
    client_addr: SocketAddr,
    upstream: &str,
    factory: Arc<TrackerFactory>,
    buffer_size: usize,
) -> std::io::Result<()> {
    let conn_id = ConnId::Socket {
        peer: client_addr,
        local: client.local_addr()?,
    };
    let target = TcpStream::connect(upstream).await?;
    debug!(conn_id = %conn_id, "Connected to upstream {}", upstream);

    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();

    tunnel_bidirectional(
        client_read,
        client_write,
        target_read,
        target_write,
        conn_id,
        &factory,
        buffer_size,
    )
    .await
}

/// Copy bytes both ways, recording each chunk before forwarding it
async fn tunnel_bidirectional<CR, CW, TR, TW>(
    mut client_read: CR,
    mut client_write: CW,
    mut target_read: TR,
    mut target_write: TW,
    conn_id: ConnId,
    factory: &TrackerFactory,
    buffer_size: usize,
) -> std::io::Result<()>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    TR: AsyncRead + Unpin,
    TW: AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; buffer_size];
    let mut target_buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            result = client_read.read(&mut client_buf) => {
                match result {
                    Ok(0) => {
                        debug!(conn_id = %conn_id, "Client closed connection");
                        let _ = target_write.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        record(factory, conn_id, Direction::ClientToUpstream, &client_buf[..n]).await;
                        target_write.write_all(&client_buf[..n]).await?;
                    }
                    Err(e) => {
                        debug!(conn_id = %conn_id, "Client read error: {}", e);
                        break;
                    }
                }
            }
            result = target_read.read(&mut target_buf) => {
                match result {
                    Ok(0) => {
                        debug!(conn_id = %conn_id, "Upstream closed connection");
                        let _ = client_write.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        record(factory, conn_id, Direction::UpstreamToClient, &target_buf[..n]).await;
                        client_write.write_all(&target_buf[..n]).await?;
                    }
                    Err(e) => {
                        debug!(conn_id = %conn_id, "Upstream read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Append a chunk to the connection's current tracker
///
/// The tracker is looked up per chunk: once a sweep has taken a finished
/// exchange, the next chunk starts a fresh tracker.
async fn record(factory: &TrackerFactory, conn_id: ConnId, direction: Direction, data: &[u8]) {
    let handle = factory.get_or_create(conn_id).await;
    let mut tracker = handle.lock().await;
    match direction {
        Direction::ClientToUpstream => tracker.append_received(data),
        Direction::UpstreamToClient => tracker.append_sent(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tunnel_forwards_and_records() {
        // Upstream that answers one request and closes
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let factory = Arc::new(TrackerFactory::new(Duration::from_secs(5), 1024 * 1024));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tunnel = tokio::spawn(run_capture_tunnel(
            listener,
            upstream_addr.to_string(),
            factory.clone(),
            4096,
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
        client
            .write_all(b"GET /health HTTP/1.1\r\nHost: svc\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.ends_with(b"\r\n\r\nok"));

        assert_eq!(factory.len().await, 1);
        let conn_id = ConnId::Socket {
            peer: client.local_addr().unwrap(),
            local: tunnel_addr,
        };
        let handle = factory.get_or_create(conn_id).await;
        let tracker = handle.lock().await;
        assert!(tracker.is_complete());
        assert_eq!(tracker.sent_buffer(), response.as_slice());

        shutdown_tx.send(()).unwrap();
        tunnel.await.unwrap().unwrap();
    }
}
