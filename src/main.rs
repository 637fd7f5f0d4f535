use anyhow::{Context, Result};
use clap::Parser;
use peerlink_lib::config::RelayConfig;
use peerlink_lib::{logger, run_relay};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::parse();
    logger::init(config.log_filter.as_deref());
    if config.notify_peer_left {
        info!("peer-left notifications enabled");
    }

    let addr = config.bind_addr();
    tokio::select! {
        res = run_relay(config) => {
            res.with_context(|| format!("relay on {addr} stopped"))?;
        }
        res = tokio::signal::ctrl_c() => {
            res.context("cannot listen for shutdown signal")?;
            info!("Shutting down relay");
        }
    }
    Ok(())
}
