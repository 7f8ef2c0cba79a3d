//! Command-line client for the shoutbox.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;

use commands::{
    client::ShoutboxClient,
    messages::{EditArgs, PostArgs},
    tail::TailArgs,
    whois::WhoisArgs,
};

/// Shoutbox CLI
#[derive(Parser)]
#[command(name = "shoutbox")]
#[command(about = "Command-line client for the live shoutbox", long_about = None)]
struct Cli {
    /// Shoutbox server base URL
    #[arg(long, global = true, default_value = "http://localhost:8080")]
    server: String,

    /// Username to act as; falls back to SHOUTBOX_USER
    #[arg(long, short, global = true)]
    user: Option<String>,

    /// Live session that should receive error events for writes
    #[arg(long, global = true)]
    session: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for the shoutbox CLI
#[derive(Subcommand)]
enum Commands {
    /// Show recent messages and follow the live stream
    Tail(TailArgs),
    /// Post a new message
    Post(PostArgs),
    /// Edit one of your messages
    Edit(EditArgs),
    /// Show a user's public profile
    Whois(WhoisArgs),
}

fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    initialize_tracing();
    let cli = Cli::parse();

    let user = cli
        .user
        .or_else(|| std::env::var("SHOUTBOX_USER").ok());
    let client = ShoutboxClient::new(&cli.server, user)?.with_session(cli.session);

    match cli.command {
        Commands::Tail(args) => commands::tail::handle_tail(client, args).await,
        Commands::Post(args) => commands::messages::handle_post(&client, args).await,
        Commands::Edit(args) => commands::messages::handle_edit(&client, args).await,
        Commands::Whois(args) => commands::whois::handle_whois(&client, args).await,
    }
}
