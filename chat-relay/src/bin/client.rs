use anyhow::Result;
use clap::Parser;

use chat_relay::{cli::ClientCli, client, config::RelayConfig, logging::init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = ClientCli::parse();
    client::run(cli.userid, &RelayConfig::from_env()).await
}
