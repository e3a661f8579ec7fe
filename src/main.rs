mod api;
mod bootstrap;
mod config;
mod error;
mod execution;
mod funding;
mod keeper;
mod ledger;
mod retry;
mod server;
mod telemetry;

use anyhow::Context;
use tracing::{error, info};

use crate::config::KeeperConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = KeeperConfig::from_env().context("failed to load keeper configuration")?;
    config.validate()?;
    telemetry::init_tracing(&config)?;

    info!("🚀 Starting inheritance keeper on {:?}", config.network);

    let state = bootstrap::initialize_keeper(&config)?;
    let keeper = state.keeper.clone();
    keeper.start()?;

    let server = config.status_bind_address.clone().map(|bind_address| {
        let app = server::create_app(state);
        tokio::spawn(async move {
            if let Err(e) = server::run_server(app, &bind_address).await {
                error!("❌ Status API failed: {}", e);
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 Shutdown requested, finishing in-flight cycle...");

    keeper.stop().await;
    if let Some(server) = server {
        server.abort();
    }

    info!("👋 Keeper stopped");
    Ok(())
}
