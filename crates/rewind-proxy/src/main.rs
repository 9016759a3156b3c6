//! Rewind Proxy - record traffic, replay it as mocks
//!
//! This is the standalone binary entry point. The mode and paths come from
//! the config file and `REWIND_*` environment variables.

use anyhow::{Context, Result};
use rewind_core::RewindConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with tracing-subscriber
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rewind_proxy=debug,rewind_core=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    tracing::info!("Starting Rewind Proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = RewindConfig::load_with_env().context("Failed to load configuration")?;
    tracing::info!("Running in {} mode", config.mode);

    rewind_proxy::run(config).await
}
