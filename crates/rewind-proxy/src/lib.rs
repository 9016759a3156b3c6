//! Rewind Proxy - traffic capture and mock replay
//!
//! In record mode the proxy sits between a client and its dependency,
//! tracks every connection and writes each finished request/response
//! exchange as a test case. In test mode it stands in for the dependency and
//! answers requests from a pool of recorded mocks.
//!
//! The pieces can be embedded separately:
//! - [`protocol`]: framing for PostgreSQL and HTTP/1.x
//! - [`capture`]: connection trackers, the sweep, and the recording tunnel
//! - [`replay`]: the mock pool, the match engine, and the replay listener

pub mod capture;
pub mod protocol;
pub mod replay;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rewind_core::{JsonLinesWriter, Mock, Mode, RewindConfig, TestCaseWriter};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use capture::{run_capture_tunnel, run_sweeper, TrackerFactory};
use replay::{run_replay_listener, MockStore};

/// Read buffer size for each direction of a tunnelled connection
pub const TUNNEL_BUFFER_SIZE: usize = 32 * 1024;

/// Run in the configured mode until Ctrl-C
pub async fn run(config: RewindConfig) -> Result<()> {
    match config.mode {
        Mode::Record => run_record(&config).await,
        Mode::Test => run_replay(&config).await,
        Mode::Unset => {
            warn!("Mode is not set to record or test, nothing to do");
            Ok(())
        }
    }
}

/// Tunnel clients to the upstream service and record finished exchanges
pub async fn run_record(config: &RewindConfig) -> Result<()> {
    let upstream = config
        .capture
        .upstream
        .clone()
        .context("capture.upstream must be set in record mode")?;

    let writer: Arc<dyn TestCaseWriter> = Arc::new(
        JsonLinesWriter::open(&config.capture.tests_path).with_context(|| {
            format!(
                "Failed to open test case file {}",
                config.capture.tests_path.display()
            )
        })?,
    );

    let factory = Arc::new(TrackerFactory::new(
        config.capture.inactivity_threshold(),
        config.capture.max_buffer_size,
    ));

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.capture.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind capture listener on {}", addr))?;

    let (sweeper_tx, sweeper_rx) = oneshot::channel();
    let sweeper = tokio::spawn(run_sweeper(
        factory.clone(),
        Mode::Record,
        writer,
        config.capture.sweep_interval(),
        sweeper_rx,
    ));

    let (tunnel_tx, tunnel_rx) = oneshot::channel();
    let tunnel = run_capture_tunnel(
        listener,
        upstream,
        factory.clone(),
        TUNNEL_BUFFER_SIZE,
        tunnel_rx,
    );

    tokio::select! {
        result = tunnel => {
            result.context("Capture tunnel failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received...");
            let _ = tunnel_tx.send(());
        }
    }

    let _ = sweeper_tx.send(());
    sweeper.await.context("Sweeper task panicked")?;

    info!("Trackers still open at exit: {}", factory.len().await);
    Ok(())
}

/// Serve recorded mocks in place of the real dependency
pub async fn run_replay(config: &RewindConfig) -> Result<()> {
    let mocks_path = config
        .replay
        .mocks_path
        .as_deref()
        .context("replay.mocks_path must be set in test mode")?;
    let mocks = load_mocks(mocks_path)?;

    let store = Arc::new(MockStore::with_mocks(mocks, config.replay.shingles));
    store.prepare_for_replay().await;

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.replay.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind replay listener on {}", addr))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = run_replay_listener(
        listener,
        store.clone(),
        config.replay.read_buffer_size,
        shutdown_rx,
    );

    tokio::select! {
        result = server => {
            result.context("Replay listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received...");
            let _ = shutdown_tx.send(());
        }
    }

    info!("Unused mocks at exit: {}", store.len().await);
    Ok(())
}

/// Load a mock pool from a JSON array of mocks
pub fn load_mocks(path: &Path) -> Result<Vec<Mock>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mocks from {}", path.display()))?;
    let mocks: Vec<Mock> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse mocks in {}", path.display()))?;
    info!("Loaded {} mocks from {}", mocks.len(), path.display());
    Ok(mocks)
}
