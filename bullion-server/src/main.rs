use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

use bullion_marketdata::MarketDataService;
use bullion_server::{spawn_housekeeping, spawn_server, telemetry, AppContext};

#[tokio::main]
async fn main() -> Result<()> {
    let environment = std::env::var("BULLION_ENV").ok();
    let config = bullion_config::load_config(environment.as_deref())
        .context("failed to load configuration")?;

    telemetry::init_tracing(&config.log_level, config.log_path.as_deref())?;
    info!(env = environment.as_deref().unwrap_or("default"), "starting bullion server");

    let ctx = AppContext::build(&config).await?;

    let metrics_addr: SocketAddr = config
        .server
        .metrics_addr
        .parse()
        .context("invalid metrics_addr")?;
    telemetry::spawn_metrics_server(ctx.metrics.registry(), metrics_addr);

    MarketDataService::spawn(ctx.market.clone());
    spawn_housekeeping(ctx.clone());

    let listen_addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .context("invalid listen_addr")?;
    let (_, server) = spawn_server(ctx, listen_addr).await?;
    server.await?;
    Ok(())
}
