//! Switchboard media node daemon

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use switchboard::{
    config::SwitchboardConfig, media::MediaNode, rpc, utils::setup_logging, Error, Result,
};

#[derive(Parser)]
#[command(name = "switchboard-media")]
#[command(about = "Switchboard RTP media node")]
#[command(version = switchboard::VERSION)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if let Some(path) = &cli.config {
        SwitchboardConfig::load_from_file(path)?
    } else {
        match SwitchboardConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => SwitchboardConfig::default_config(),
        }
    };
    config.validate()?;
    // keeps the file writer flushing until the daemon exits
    let _log_guard = setup_logging(&config.logging)?;

    info!(
        "Starting {} media node v{}",
        switchboard::NAME,
        switchboard::VERSION
    );

    let node = Arc::new(MediaNode::new(&config.media));
    let listener = TcpListener::bind((config.media.rpc_listen_addr, config.media.rpc_listen_port))
        .await
        .map_err(|e| {
            Error::transport(format!(
                "Cannot bind RPC listener {}:{}: {}",
                config.media.rpc_listen_addr, config.media.rpc_listen_port, e
            ))
        })?;

    info!(
        addr = ?listener.local_addr(),
        ports = ?config.media.port_range,
        "media node ready"
    );

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(rpc::server::serve(
        Arc::clone(&node),
        listener,
        shutdown.clone(),
    ));

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    shutdown.cancel();
    node.shutdown();
    let _ = server.await;

    info!("Media node shutdown complete");
    Ok(())
}
