//! Procman: a single-node process supervisor with an HTTP control plane.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the configuration, and either runs the control plane
//! (`serve`) or acts as an HTTP client against a running instance.

mod client;
mod config;
mod error;
mod output;
mod registry;
mod serve;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::client::{ControlClient, ListFormat};
use crate::config::ConfigStore;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "procman",
    version,
    about = "Single-node process supervisor with an HTTP control plane"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the control plane in the foreground.
    Serve,
    /// List configured processes and whether they are running.
    List {
        /// Output format.
        #[arg(long, value_enum, default_value = "table")]
        format: ListFormat,
    },
    /// Register the current directory as a process definition.
    Add {
        /// Definition name (defaults to the directory basename).
        #[arg(long)]
        name: Option<String>,
        /// Command line to run.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Remove a process definition.
    Remove { name: String },
    /// Start the process for a definition.
    Start { name: String },
    /// Stop a running process.
    Stop { name: String },
    /// Tail the output of a process.
    Logs { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = match &cli.config {
        Some(path) => ConfigStore::load_from(path.clone()),
        None => ConfigStore::load_default(),
    }
    .context("failed to load configuration")?;

    match cli.command {
        Commands::Serve => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("procman=info,tower_http=warn")),
                )
                .init();
            serve::run(store).await
        }
        command => {
            let addr = store.settings().listen_addr();
            let result = run_client_command(&addr, command).await;
            if let Err(err) = result {
                eprintln!("procman: {}", err);
                std::process::exit(err.exit_code());
            }
            Ok(())
        }
    }
}

async fn run_client_command(addr: &str, command: Commands) -> Result<(), client::ClientError> {
    let client = ControlClient::new(addr)?;
    match command {
        Commands::Serve => unreachable!("handled by the caller"),
        Commands::List { format } => client.list(format).await,
        Commands::Add { name, command } => client.add(name, &command).await,
        Commands::Remove { name } => client.remove(&name).await,
        Commands::Start { name } => client.start(&name).await,
        Commands::Stop { name } => client.stop(&name).await,
        Commands::Logs { name } => client.logs(&name).await,
    }
}
