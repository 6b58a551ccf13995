//! Duet relay
//!
//! Serves room creation, joining and membership checks, and relays
//! negotiation signals between the two members of each room.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duet_core::{MemoryStore, SessionStore};
use duet_net::{Outbox, RelayServer};

mod config;

use config::{ConfigError, RelayConfig};

#[derive(Parser, Debug)]
#[command(name = "duet-relay", version, about = "Pairing and signaling relay for Duet")]
struct Args {
    /// Config file (defaults to relay.toml in the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the config file
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(args: &Args) -> Result<RelayConfig, ConfigError> {
    let mut config = match args.config.clone().or_else(RelayConfig::default_path) {
        Some(path) => RelayConfig::load(&path)?,
        None => RelayConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();
    let loaded = load_config(&args);

    // Initialize logging
    let fallback = loaded
        .as_ref()
        .map(|config| config.log_level.as_str())
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Duet relay");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("Relay failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: RelayConfig) -> duet_net::Result<()> {
    let store = Arc::new(MemoryStore::<Outbox>::with_tokens(config.token_generator()));
    let server = RelayServer::start(config.socket_addr(), store).await?;
    info!(addr = %server.addr(), "Relay ready");

    tokio::signal::ctrl_c().await?;
    server.shutdown();

    let stats = server.store().stats();
    info!(
        rooms = stats.rooms,
        identities = stats.identities,
        connections = stats.connections,
        "Relay stopped"
    );
    Ok(())
}
