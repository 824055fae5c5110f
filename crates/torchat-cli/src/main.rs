//! Terminal front end for the torchat-net core.
//!
//! Starts the reactor on a dedicated thread, prints peer events, and sends
//! chat messages typed on stdin.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// Anonymous peer-to-peer chat over a SOCKS4a proxy
#[derive(Parser)]
#[command(name = "torchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat client
    Start {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Our own onion service id (overrides the config file)
        #[arg(long)]
        onion: Option<String>,

        /// Port for incoming peer connections
        #[arg(long)]
        listen_port: Option<u16>,

        /// SOCKS proxy host
        #[arg(long)]
        proxy_host: Option<String>,

        /// SOCKS proxy port
        #[arg(long)]
        proxy_port: Option<u16>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start {
            config,
            onion,
            listen_port,
            proxy_host,
            proxy_port,
        } => commands::start(config, onion, listen_port, proxy_host, proxy_port),
    }
}
