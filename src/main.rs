mod config;
mod error;
mod media;
mod session;
mod signal;
mod turn;

use std::process;

use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;
use crate::signal::StdinSource;

fn init_log() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() {
    init_log();

    if let Err(e) = run().await {
        error!("relay terminated: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = RelayConfig::from_env()?;
    session::run(&cfg, Box::new(StdinSource)).await?;
    Ok(())
}
