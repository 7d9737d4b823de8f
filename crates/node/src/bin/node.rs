//! Operator node binary.
//!
//! Transport, beacon client, storage engine and key loading are injected by
//! the embedding deployment; this binary wires configuration and telemetry
//! and reports what else it needs.

use clap::Parser;
use dv_node::{telemetry, Config, LogFormat, NetworkPreset};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "dv-node", about = "Distributed validator operator node")]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[arg(long, value_enum)]
    network: Option<NetworkPreset>,

    #[arg(long)]
    db_path: Option<PathBuf>,

    #[arg(long)]
    ws_api_port: Option<u16>,
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(path) = &cli.db_path {
        config.db_path = path.clone();
    }
    if let Some(port) = cli.ws_api_port {
        config.ws_api_port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = telemetry::init_telemetry(&config.log_level, config.log_format) {
        eprintln!("failed to initialize telemetry: {err}");
        std::process::exit(1);
    }

    let network = match config.network_config() {
        Ok(network) => network,
        Err(err) => {
            error!(%err, "invalid network configuration");
            std::process::exit(1);
        }
    };
    info!(
        network = %network.name,
        registry = %network.registry_contract_addr,
        api_port = config.ws_api_port,
        "configuration loaded"
    );

    // The duty pipeline starts once the deployment provides its transport,
    // beacon client, storage engine and share keys through Node::start.
    error!("no deployment wiring present: supply NodeDeps via dv_node::Node::start");
    std::process::exit(1);
}
