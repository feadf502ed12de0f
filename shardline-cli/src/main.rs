//! Shardline CLI
//!
//! Command-line front end for the Shardline client.
//!
//! # Commands
//! - `simulate` - Upload and read back an object on an in-process cluster
//! - `hash` - Show the object hash and block layout of a file
//! - `config` - Show or initialize configuration
//!
//! # Configuration
//! Config file: ~/.shardline/config.toml (override with `--config`)

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;

mod commands;
mod config;
mod symbols;

use commands::{hash, simulate};

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Shardline block storage client")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.shardline/config.toml)
    #[arg(long, global = true, env = "SHARDLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload an object to an in-process cluster and read a range back
    Simulate {
        /// Upload this file instead of random data
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Size of the random object in bytes
        #[arg(short, long, default_value = "8388608")]
        size: usize,

        /// Number of storage nodes
        #[arg(short, long, default_value = "20")]
        nodes: usize,

        /// Nodes that reject every put
        #[arg(long, default_value = "0")]
        failing: usize,

        /// Nodes that never respond
        #[arg(long, default_value = "0")]
        hung: usize,

        /// Users uploading the same object
        #[arg(short, long, default_value = "1")]
        users: u64,

        /// Byte range to read back, as start:end
        #[arg(short, long)]
        range: Option<String>,
    },

    /// Show the object hash and block layout of a file
    Hash {
        /// Path to the file
        path: PathBuf,
    },

    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Show config file path
    Path,

    /// Write a config file with defaults
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_config(cli.config.as_deref());
    if cli.verbose {
        cfg.logging.level = "debug".to_string();
    }
    shardline_client::init_tracing(&cfg.logging);

    match cli.command {
        Commands::Simulate {
            file,
            size,
            nodes,
            failing,
            hung,
            users,
            range,
        } => {
            let sim = simulate::SimulateConfig {
                file,
                size,
                nodes,
                failing,
                hung,
                users,
                range,
            };
            simulate::run(cfg, sim).await?;
        }

        Commands::Hash { path } => {
            hash::run(&path, cfg.chunking.block_size).await?;
        }

        Commands::Config { command } => {
            handle_config_command(cli.config, &cfg, command)?;
        }
    }

    Ok(())
}

/// Handle config subcommands
fn handle_config_command(
    explicit: Option<PathBuf>,
    cfg: &shardline_client::ClientConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let path = config::resolve_path(explicit.as_deref())?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Shardline Configuration").bold().underlined());
            println!();
            println!("{}", cfg.to_toml()?);

            println!("{} {}", style("Config file:").dim(), path.display());
            if !path.exists() {
                println!(
                    "{} Run '{}' to create it",
                    style("(not created yet)").yellow(),
                    style("shardline config init").green()
                );
            }
        }

        Some(ConfigCommands::Path) => {
            println!("{}", path.display());
        }

        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!(
                    "{} Config file already exists at {}",
                    style(symbols::WARN).yellow(),
                    path.display()
                );
                println!("Use --force to overwrite");
                return Ok(());
            }

            config::save_config(&path, &shardline_client::ClientConfig::default())?;
            println!(
                "{} Config file created at {}",
                style(symbols::CHECK).green(),
                path.display()
            );
        }
    }

    Ok(())
}
