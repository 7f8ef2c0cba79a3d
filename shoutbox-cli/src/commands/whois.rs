use anyhow::{Context, Result, bail};
use clap::Args;

use super::client::ShoutboxClient;

#[derive(Args, Debug)]
#[command(about = "Show a user's public profile")]
pub struct WhoisArgs {
    /// Username to look up
    pub username: String,
}

pub async fn handle_whois(client: &ShoutboxClient, args: WhoisArgs) -> Result<()> {
    let Some(profile) = client
        .profile(&args.username)
        .await
        .context("failed to look up user")?
    else {
        bail!("user {} not found", args.username);
    };

    println!("username: {}", profile.username);
    println!(
        "avatar:   {}",
        profile.avatar_url.as_deref().unwrap_or("(default)")
    );
    Ok(())
}
