//! CivicVault - chunked file storage over a cluster of partition nodes
//!
//! One binary runs every role: `manager`, `node --id N`, and the one-shot
//! `store`, `fetch` and `nodes` commands.

use civicvault_core::{run, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let (config, action) = Config::from_cli()?;

    init_logging(&config.log_level);

    tracing::info!("Starting CivicVault {}...", action.name());

    run(config, action).await?;

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
