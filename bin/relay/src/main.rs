mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Chat-driven dispatcher for command-line AI agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the config directory and workspace files
    Onboard {
        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and state summary
    Status,

    /// Run the dispatcher (long-running daemon)
    Gateway,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => commands::onboard::run(force).await?,
        Commands::Status => commands::status::run().await?,
        Commands::Gateway => commands::gateway::run().await?,
    }

    Ok(())
}
