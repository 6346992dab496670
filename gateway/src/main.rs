use clap::{Parser, Subcommand};
use tracing::info;

use tapgate::{FramedConfig, StreamConfig, TapConfig};

/// tapgate - call-audio tap and media gateway for an Asterisk PBX
#[derive(Parser, Debug)]
#[command(name = "tapgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Component to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tap orchestrator (ARI control plane + /start_tap)
    Tap,
    /// Run the framed-TCP media gateway
    Framed,
    /// Run the streaming media gateway
    Stream,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before config; ignore a missing file.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    // The upstream speech socket is TLS; the provider must be installed
    // before the first connection.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Tap => {
            let config = TapConfig::from_env()?;
            info!(app = %config.stasis_app, "starting tap orchestrator");
            tapgate::tap::TapOrchestrator::run(config).await?;
        }
        Commands::Framed => {
            let config = FramedConfig::from_env()?;
            info!(downstream = %config.downstream_addr(), "starting framed gateway");
            tapgate::framed::FramedGateway::run(config).await?;
        }
        Commands::Stream => {
            let config = StreamConfig::from_env()?;
            info!("starting streaming gateway");
            tapgate::stream::StreamGateway::run(config).await?;
        }
    }
    Ok(())
}
