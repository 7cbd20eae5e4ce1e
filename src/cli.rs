// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - serve (default): run the full service
// - config --show | --path: inspect configuration
// - model list|download|delete: manage STT models without the server

use crate::config::{Config, VERSION};
use crate::stt::ModelManager;
use clap::{Parser, Subcommand};

/// memodesk - voice memos in, project artefacts out
#[derive(Parser)]
#[command(name = "memodesk")]
#[command(version = VERSION)]
#[command(about = "Self-hosted voice memo pipeline for a tech lead", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
    /// Manage speech-to-text models
    Model {
        #[command(subcommand)]
        command: ModelCommands,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List catalogue models and their on-disk state
    List,
    /// Download a model (tiny | base | small)
    Download { size: String },
    /// Delete a downloaded model
    Delete { size: String },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub async fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, path }) => {
            if path {
                match Config::config_path() {
                    Some(p) => println!("{}", p.display()),
                    None => eprintln!("Could not determine home directory"),
                }
            } else if show {
                let config = Config::from_env();
                println!("{:#?}", config);
            } else {
                println!("Usage: memodesk config [--show|--path]");
            }
            true
        }
        Some(Commands::Model { command }) => {
            let config = Config::from_env();
            if let Err(e) = handle_model(command, &config).await {
                eprintln!("model command failed: {}", e);
                std::process::exit(1);
            }
            true
        }
        None => false, // No subcommand, run the service
    }
}

async fn handle_model(command: ModelCommands, config: &Config) -> anyhow::Result<()> {
    let manager = ModelManager::new(&config.whisper.models_dir)?;
    match command {
        ModelCommands::List => {
            for status in manager.list() {
                let state = if status.present {
                    format!("{} bytes", status.bytes_on_disk.unwrap_or(0))
                } else {
                    "not downloaded".to_string()
                };
                println!("{:<6} {:<18} {}", status.size, status.filename, state);
            }
        }
        ModelCommands::Download { size } => {
            let path = manager.ensure_model(&size).await?;
            println!("{}", path.display());
        }
        ModelCommands::Delete { size } => {
            if manager.delete(&size)? {
                println!("deleted {}", size);
            } else {
                println!("{} was not downloaded", size);
            }
        }
    }
    Ok(())
}
