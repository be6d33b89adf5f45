//! cinebot - Main entry point.

use anyhow::Result;
use cine_channels::start_server;
use cine_common::config::Config;
use cine_common::logging::{init_logging, with_bootstrap_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = with_bootstrap_logging(Config::load_with_env)?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Starting cinebot v{}", env!("CARGO_PKG_VERSION"));
    for (name, status) in config.credential_report() {
        tracing::info!("{}: {}", name, status.as_str());
    }

    if let Err(e) = start_server(&config).await {
        tracing::error!(error = %e, "Error starting the bot");
        return Err(e);
    }

    Ok(())
}
