//! Replay server
//!
//! Stands in for a recorded dependency: every chunk a client sends is
//! matched against the mock pool and answered with the recorded response.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use super::store::{MockStore, Reply};
use crate::protocol::postgres::{decode_payload, is_postgres_protocol, split_frontend};

/// Accept clients on `listener` and answer them from `store` until shutdown
pub async fn run_replay_listener(
    listener: TcpListener,
    store: Arc<MockStore>,
    read_buffer_size: usize,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(
        "Replay listener on {} serving {} mocks",
        local_addr,
        store.len().await
    );

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        debug!("New replay connection from {}", client_addr);
                        let store = store.clone();

                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, client_addr, store, read_buffer_size).await {
                                debug!("Replay connection {} ended with error: {}", client_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = &mut shutdown_rx => {
                debug!("Replay listener shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    store: Arc<MockStore>,
    read_buffer_size: usize,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; read_buffer_size];
    let mut turn = ClientTurn::default();

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("Replay client {} closed connection", client_addr);
            return Ok(());
        }

        let Some(request) = turn.push(&buf[..n]) else {
            trace!("Waiting for the rest of a frame from {}", client_addr);
            continue;
        };

        match respond(&store, &request).await {
            Some(response) => stream.write_all(&response).await?,
            None => {
                warn!(
                    "No mock matched {} byte request from {}, closing connection",
                    request.len(),
                    client_addr
                );
                let _ = stream.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Bytes a client has sent since its last answered request
///
/// Once a connection is recognised as PostgreSQL, a request is only handed
/// out when it ends on a frame boundary, so a message split across reads is
/// matched whole. Pipelined frames that arrive together stay together, the
/// same way a capture records them.
#[derive(Debug, Default)]
struct ClientTurn {
    pending: Vec<u8>,
    framed: bool,
}

impl ClientTurn {
    fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(data);

        if !self.framed && is_postgres_protocol(&self.pending) {
            self.framed = true;
        }

        if self.framed {
            match split_frontend(&self.pending) {
                Ok(_) => {}
                Err(e) if e.is_incomplete() => return None,
                Err(e) => debug!(error = %e, "Client bytes do not frame, matching them as read"),
            }
        }

        Some(std::mem::take(&mut self.pending))
    }
}

/// Raw bytes to send back for one request, consuming the matched mock
pub async fn respond(store: &MockStore, request: &[u8]) -> Option<Vec<u8>> {
    let encoded: Vec<String> = match store.match_request(request).await? {
        Reply::Single(response) => vec![response],
        Reply::Sequence(responses) => responses
            .into_iter()
            .flat_map(|p| p.message.into_iter().map(|m| m.data))
            .collect(),
    };

    let mut out = Vec::new();
    for data in &encoded {
        match decode_payload(data) {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(e) => {
                error!(error = %e, "Recorded response is not valid base64");
                return None;
            }
        }
    }
    Some(out)
}
