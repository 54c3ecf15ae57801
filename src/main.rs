//! AMQP relay - main entry point
//!
//! Acquires a supervised broker session and either keeps it alive or
//! publishes a single message through it.

use amqp_relay::config::RelayConfig;
use amqp_relay::error::RelayError;
use amqp_relay::observability::init_default_logging;
use amqp_relay::protocol::RestRequest;
use amqp_relay::transport::amqp::{ConnectionSupervisor, LapinBroker, Publisher, SessionState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Self-healing AMQP relay
#[derive(Parser)]
#[command(name = "amqp-relay")]
#[command(about = "Supervised AMQP connection and relay publisher")]
#[command(version)]
struct Cli {
    /// Configuration file path (environment variables override it)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep a broker session alive until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration with credentials masked
        #[arg(long)]
        show: bool,
    },
    /// Publish a chat message request to the request exchange
    Publish {
        /// Target channel id
        #[arg(long)]
        channel_id: String,
        /// Environment variable holding the bot token
        #[arg(long, default_value = "DISCORD_TOKEN_0")]
        token_env: String,
        /// Message content
        #[arg(long)]
        content: String,
    },
    /// Send a plain-text message to the discord queue
    Discord {
        /// Message text
        text: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting amqp-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Publish {
            channel_id,
            token_env,
            content,
        } => publish_message(config, &channel_id, &token_env, &content).await,
        Commands::Discord { text } => send_discord(config, &text).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<RelayConfig, RelayError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(RelayConfig::load_from_file(path)?)
        }
        None => {
            let default_path = PathBuf::from("relay.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                Ok(RelayConfig::load_from_file(&default_path)?)
            } else {
                Ok(RelayConfig::from_env()?)
            }
        }
    }
}

fn supervisor(config: &RelayConfig) -> Arc<ConnectionSupervisor<LapinBroker>> {
    let broker = LapinBroker::new().with_dial_timeout(config.dial_timeout());
    Arc::new(ConnectionSupervisor::from_config(broker, config))
}

async fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = supervisor(&config);
    let handle = supervisor.acquire().await;
    info!(generation = handle.generation(), "Relay session ready");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut status = handle.subscribe_status();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("Supervisor status channel closed");
                    break;
                }
                let current = *status.borrow_and_update();
                if current.state == SessionState::Live {
                    info!(generation = current.generation, "Relay session live");
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn handle_config_command(config: RelayConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        let mut shown = config.clone();
        shown.broker.password = "****".to_string();
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&shown)?);
        println!("Candidate endpoints:");
        for endpoint in config.endpoints() {
            println!("  {endpoint}");
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn publish_message(
    config: RelayConfig,
    channel_id: &str,
    token_env: &str,
    content: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var(token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RelayError::missing_token(token_env))?;

    let supervisor = supervisor(&config);
    let handle = supervisor.acquire().await;
    let publisher = Publisher::new(handle.clone(), config.topology.request_exchange.clone());

    let request = RestRequest::create_message(channel_id, &token, content);
    publisher.publish_rest_request(&request).await?;
    info!(path = %request.path, "Message request published");

    handle.shutdown().await;
    Ok(())
}

async fn send_discord(config: RelayConfig, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = supervisor(&config);
    let handle = supervisor.acquire().await;
    let publisher = Publisher::new(handle.clone(), config.topology.request_exchange.clone());

    publisher.send_to_discord(text).await?;
    info!("Discord message published");

    handle.shutdown().await;
    Ok(())
}
