//! roomdrop signaling relay
//!
//! Usage:
//!   roomdrop-relay [--addr 127.0.0.1:3000] [--config path/to/config.toml]

use anyhow::{Context, Result};
use clap::Parser;
use roomdrop_config::Config;
use roomdrop_relay::{Relay, RelayServer};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roomdrop-relay")]
#[command(about = "Signaling relay pairing two roomdrop peers", long_about = None)]
struct Cli {
    /// Address to listen on (overrides the config file)
    #[arg(long)]
    addr: Option<String>,

    /// Config file (defaults to ~/.roomdrop/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "roomdrop_relay=info"
                    .parse()
                    .context("Invalid log directive")?,
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let addr = cli.addr.unwrap_or_else(|| config.relay.bind_address.clone());

    let relay = Relay::new(config.relay);
    RelayServer::new(relay, addr).run().await
}
