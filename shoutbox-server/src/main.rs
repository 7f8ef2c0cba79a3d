#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::multiple_crate_versions)]

//! Main entry point for the shoutbox server binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;

/// Command line for the shoutbox server.
#[derive(Parser)]
#[command(name = "shoutbox-server")]
#[command(about = "Live shoutbox server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Server subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind, overriding configuration (e.g., `--port 8080`)
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a YAML, JSON, or TOML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the resolved configuration and exit
    Config {
        /// Path to a YAML, JSON, or TOML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the OpenAPI document as YAML and exit
    Openapi,
}

/// Loads configuration and starts the server.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port).context("failed to load configuration")?;
    server::server::run(resolved).await
}

fn handle_config_command(config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, None).context("failed to load configuration")?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

fn handle_openapi_command() -> anyhow::Result<()> {
    use utoipa::OpenApi;

    let yaml = server::openapi::ApiDoc::openapi()
        .to_yaml()
        .context("failed to render OpenAPI document")?;
    println!("{yaml}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
        Commands::Config { config } => handle_config_command(config),
        Commands::Openapi => handle_openapi_command(),
    }
}
