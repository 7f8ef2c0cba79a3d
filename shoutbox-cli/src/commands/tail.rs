use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Args;
use futures_util::StreamExt;
use shared::{
    identity::AvatarCache,
    models::ShoutboxEvent,
    reconcile::{ReconcileSignal, Reconciler},
};
use tokio::time::{interval, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    client::{HttpIdentityLookup, ShoutboxClient},
    sse::{SseFrame, SseParser},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const PATCH_POLL: Duration = Duration::from_millis(250);
const RECENT_AUTHORS: usize = 10;

#[derive(Args, Debug)]
#[command(about = "Show recent messages and follow the live stream")]
pub struct TailArgs {
    /// Number of messages to load and display
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Print the current history and exit without following
    #[arg(long)]
    pub once: bool,

    /// Seconds between session heartbeats; defaults to the server's keep-alive interval
    #[arg(long)]
    pub heartbeat: Option<u64>,
}

type Lookup = HttpIdentityLookup;

pub async fn handle_tail(client: ShoutboxClient, args: TailArgs) -> Result<()> {
    let page = client
        .history(Some(args.limit), None)
        .await
        .context("failed to fetch history")?;
    let settings = client
        .settings()
        .await
        .context("failed to fetch server settings")?;

    let avatars = Arc::new(AvatarCache::new(
        HttpIdentityLookup::new(client.clone()),
        settings.default_avatar.clone(),
        Duration::from_secs(settings.avatar_ttl_seconds),
    ));
    let mut reconciler = Reconciler::new(avatars);
    let mut cursor = page.cursor;
    reconciler.initialize(page.messages);
    render(&reconciler, args.limit);

    if args.once {
        return Ok(());
    }

    let heartbeat_every =
        Duration::from_secs(args.heartbeat.unwrap_or(settings.heartbeat_seconds).max(1));
    println!("Following the shoutbox... (press Ctrl+C to stop)");
    let mut last_event_id: Option<String> = None;

    // One listener for the whole run, so a press while reconnecting is not lost.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let request = client.stream(cursor, last_event_id.as_deref())?;
        let sent = tokio::select! {
            sent = request.send() => sent,
            _ = &mut ctrl_c => return Ok(()),
        };
        let response = match sent.and_then(reqwest::Response::error_for_status) {
            Ok(response) => response,
            Err(err) => {
                eprintln!("[stream] connection failed: {err}");
                if pause(RECONNECT_DELAY, &mut ctrl_c).await {
                    return Ok(());
                }
                continue;
            }
        };

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut session: Option<Uuid> = None;
        let mut heartbeat = interval(heartbeat_every);
        heartbeat.tick().await;
        let mut patch_tick = interval(PATCH_POLL);

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    let bytes = match chunk {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(err)) => {
                            eprintln!("[stream] chunk error: {err}");
                            break;
                        }
                        None => break,
                    };
                    for frame in parser.push(&bytes) {
                        if let Some(id) = frame.id.clone() {
                            last_event_id = Some(id);
                        }
                        if let Some(signal) = decode(&mut reconciler, &frame) {
                            match signal {
                                ReconcileSignal::Applied { changed } => {
                                    if changed > 0 {
                                        render(&reconciler, args.limit);
                                    }
                                }
                                ReconcileSignal::Connected { session_id, head_sequence } => {
                                    debug!(%session_id, head_sequence, "stream attached");
                                    session = Some(session_id);
                                }
                                ReconcileSignal::ResyncRequired { head_sequence } => {
                                    eprintln!("[stream] fell too far behind; reloading history");
                                    let page = client
                                        .history(Some(args.limit), None)
                                        .await
                                        .context("failed to reload history")?;
                                    reconciler.initialize(page.messages);
                                    cursor = head_sequence;
                                    render(&reconciler, args.limit);
                                }
                                ReconcileSignal::Error(error) => {
                                    eprintln!("[shoutbox] {}: {}", error.code, error.message);
                                }
                            }
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(session_id) = session {
                        match client.heartbeat(session_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(%session_id, "session expired; reconnecting");
                                break;
                            }
                            Err(err) => warn!(error = %err, "heartbeat failed"),
                        }
                    }
                }
                _ = patch_tick.tick() => {
                    if reconciler.apply_patches() > 0 {
                        render(&reconciler, args.limit);
                    }
                }
                _ = &mut ctrl_c => {
                    if let Some(session_id) = session
                        && let Err(err) = client.close_session(session_id).await
                    {
                        warn!(error = %err, "failed to close session");
                    }
                    return Ok(());
                }
            }
        }

        if pause(RECONNECT_DELAY, &mut ctrl_c).await {
            return Ok(());
        }
    }
}

/// Waits out `delay` unless `interrupt` fires first. Returns `true` when
/// interrupted.
async fn pause<F: Future + Unpin>(delay: Duration, interrupt: &mut F) -> bool {
    tokio::select! {
        () = sleep(delay) => false,
        _ = interrupt => true,
    }
}

fn decode(reconciler: &mut Reconciler<Lookup>, frame: &SseFrame) -> Option<ReconcileSignal> {
    match serde_json::from_str::<ShoutboxEvent>(&frame.data) {
        Ok(event) => Some(reconciler.apply_event(event)),
        Err(err) => {
            if !frame.data.is_empty() {
                warn!(error = %err, event = ?frame.event, "undecodable stream event");
            }
            None
        }
    }
}

fn render(reconciler: &Reconciler<Lookup>, limit: usize) {
    let entries: Vec<_> = reconciler.view().current_view().take(limit).collect();
    println!(
        "---- {} message(s) | {} ----",
        entries.len(),
        recently_active(&reconciler.recent_authors(RECENT_AUTHORS))
    );
    for entry in entries.into_iter().rev() {
        let message = &entry.message;
        let avatar = entry.avatar_url.as_deref().unwrap_or("…");
        let edited = if message.is_edited() { " (edited)" } else { "" };
        println!(
            "#{} [{}] {} <{}>: {}{}",
            message.id, message.created_at, message.author, avatar, message.body, edited
        );
    }
}

/// Header badge built from who spoke recently. It approximates presence; the
/// server's `/api/shoutbox/online` is the real signal.
fn recently_active(authors: &[String]) -> String {
    if authors.is_empty() {
        return "nobody active recently".to_string();
    }
    format!("{} recently active: {}", authors.len(), authors.join(", "))
}
