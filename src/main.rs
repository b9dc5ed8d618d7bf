use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hengdang::commands;

#[derive(Parser)]
#[command(name = "hengdang")]
#[command(version, about = "Personal file store with filesystem semantics over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Path to config.toml (default: ~/.hengdang/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory for the database
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Remove expired sessions and locks, then exit
    Cleanup {
        /// Path to config.toml (default: ~/.hengdang/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            data_dir,
        } => commands::serve::execute(config.as_deref(), port, data_dir).await,
        Commands::Cleanup { config } => commands::cleanup::execute(config.as_deref()).await,
    }
}
