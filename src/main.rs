//! Switchboard signaling daemon

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use switchboard::{
    config::SwitchboardConfig, core::SwitchboardEngine, utils::setup_logging, Result,
};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "SIP B2BUA signaling daemon")]
#[command(version = switchboard::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the signaling daemon
    Start,
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    // keeps the file writer flushing until the daemon exits
    let _log_guard = setup_logging(&config.logging)?;

    info!("Starting {} v{}", switchboard::NAME, switchboard::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => run_daemon(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()),
    }
}

fn load_configuration(cli: &Cli) -> Result<SwitchboardConfig> {
    let config = if let Some(config_path) = &cli.config {
        SwitchboardConfig::load_from_file(config_path)?
    } else {
        match SwitchboardConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => SwitchboardConfig::default_config(),
        }
    };

    config.validate()?;
    Ok(config)
}

async fn run_daemon(config: SwitchboardConfig) -> Result<()> {
    let engine = SwitchboardEngine::start(config).await?;

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully");
            engine.stop();
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            engine.stop();
        }
    }

    info!("Switchboard shutdown complete");
    Ok(())
}

fn validate_configuration(config: &SwitchboardConfig) -> Result<()> {
    config.validate()?;

    println!("Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  SIP: {}:{}", config.sip.listen_addr, config.sip.listen_port);
    println!("  Domain: {}", config.sip.domain);
    println!("  Pool members: {}", config.pool.members.len());
    println!(
        "  Dialplan: {}",
        config.dialplan.file.as_deref().unwrap_or("(none)")
    );

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = SwitchboardConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| switchboard::Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}
