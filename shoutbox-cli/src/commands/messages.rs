use anyhow::Result;
use clap::Args;
use shared::models::{Message, MessageId};

use super::client::{ClientError, ShoutboxClient};

#[derive(Args, Debug)]
#[command(about = "Post a new message")]
pub struct PostArgs {
    /// Message text
    pub body: String,
}

#[derive(Args, Debug)]
#[command(about = "Edit one of your messages")]
pub struct EditArgs {
    /// Id of the message to edit
    pub id: MessageId,

    /// Replacement text
    pub body: String,
}

pub async fn handle_post(client: &ShoutboxClient, args: PostArgs) -> Result<()> {
    let message = client
        .submit(&args.body)
        .await
        .map_err(|err| explain("post", &args.body, err))?;
    print_accepted("posted", &message);
    Ok(())
}

pub async fn handle_edit(client: &ShoutboxClient, args: EditArgs) -> Result<()> {
    let message = client
        .edit(args.id, &args.body)
        .await
        .map_err(|err| explain("edit", &args.body, err))?;
    print_accepted("edited", &message);
    Ok(())
}

fn print_accepted(verb: &str, message: &Message) {
    println!(
        "{verb} #{} (revision {}) as {}",
        message.id, message.revision, message.author
    );
}

/// Turns a client failure into a user-facing error. Retryable failures echo
/// the unsent text so nothing typed is lost.
fn explain(action: &str, body: &str, err: ClientError) -> anyhow::Error {
    if err.is_retryable() {
        eprintln!("unsent text: {body}");
    }
    let hint = match (err.is_retryable(), err.retry_after_seconds()) {
        (true, Some(seconds)) => format!("; please retry in {seconds}s"),
        (true, None) => "; please retry".to_string(),
        (false, _) => String::new(),
    };
    anyhow::anyhow!("failed to {action} message: {err}{hint}")
}
