//! playnet - Multiplayer game server
//!
//! Hosts players over the playnet line protocol.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use playnet::config::{self, Config};
use playnet::protocol;
use playnet::GameServer;

/// playnet - Multiplayer game server
#[derive(Parser)]
#[command(name = "playnet")]
#[command(author = "playnet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Host a real-time multiplayer game server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the game server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Server name to advertise
        #[arg(short, long)]
        name: Option<String>,

        /// Maximum number of players
        #[arg(short, long)]
        max_players: Option<usize>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Serve {
            port,
            name,
            max_players,
        } => {
            run_server(config, port, name, max_players).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the game server until Ctrl+C
async fn run_server(
    mut config: Config,
    port: Option<u16>,
    name: Option<String>,
    max_players: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.network.port = port;
    }
    if let Some(name) = name {
        config.server.name = name;
    }
    if let Some(max_players) = max_players {
        config.server.max_players = max_players;
    }

    tracing::info!(
        "Starting playnet server '{}' on port {}",
        config.server.name,
        config.network.port
    );

    let server_name = config.server.name.clone();
    let capacity = config.server.max_players;
    let mut server = GameServer::new(config)?;
    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  playnet Server Running");
    println!("========================================");
    println!("  Name: {}", server_name);
    println!("  Address: {}", local_addr);
    println!("  Players: up to {}", capacity);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        println!("\nShutting down...");
        shutdown.cancel();
    });

    server.run().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("playnet Protocol Information");
    println!("============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Frame Length: {} bytes", protocol::DEFAULT_MAX_FRAME_LEN);
    println!(
        "Frame Layout: version{d}code{d}origin{d}count{d}fields...",
        d = protocol::FIELD_DELIMITER
    );

    println!("\nMessage Types:");
    for code in 1..=8 {
        println!("  {:>2}  {:?}", code, protocol::MessageType::from_code(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["playnet", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["playnet", "--verbose", "serve", "--port", "9000", "-m", "4"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Serve {
                port, max_players, ..
            } => {
                assert_eq!(port, Some(9000));
                assert_eq!(max_players, Some(4));
            }
            _ => panic!("expected serve"),
        }
    }
}
