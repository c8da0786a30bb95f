use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{cli::ServerCli, config::RelayConfig, logging::init_tracing, server::Server};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let ServerCli {} = ServerCli::parse();

    let server = Server::bind(RelayConfig::from_env()).await?;
    let addr = server.local_addr()?;
    info!("chat server listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("chat server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
