//! Ordered broadcast of accepted messages to every attached session.
//!
//! A single lock guards sequence assignment, the replay buffer, and delivery,
//! so every session observes publishes in the same order and an attach can
//! never fall between a replay snapshot and live delivery.

use shared::{
    config::server::FanoutConfig,
    models::{Message, ShoutboxEvent},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc, mpsc::error::TrySendError},
    time::Instant,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Reason reported when a cursor can no longer be replayed.
pub const STALE_CURSOR: &str = "stale_cursor";

/// Which live event a publish produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    /// A newly accepted message.
    Created,
    /// An accepted edit of an existing message.
    Edited,
}

impl PublishKind {
    fn event(self, message: Message) -> ShoutboxEvent {
        match self {
            Self::Created => ShoutboxEvent::Message { payload: message },
            Self::Edited => ShoutboxEvent::MessageUpdated { payload: message },
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
        }
    }
}

/// An event queued for one session. Sequenced events carry their fanout
/// sequence; ephemeral ones (acknowledgements, errors) do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Fanout sequence, `None` for ephemeral events.
    pub sequence: Option<u64>,
    /// Payload.
    pub event: ShoutboxEvent,
}

impl StreamEvent {
    /// Wraps an unsequenced event.
    #[must_use]
    pub const fn ephemeral(event: ShoutboxEvent) -> Self {
        Self {
            sequence: None,
            event,
        }
    }
}

/// What an attaching session gets before live delivery starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Messages published after the cursor, in publish order.
    Events {
        /// Replayed messages; an edited message may appear more than once.
        messages: Vec<Message>,
        /// Sequence of the last replayed event.
        through_sequence: u64,
    },
    /// The cursor predates the buffer or is ahead of the head.
    Stale,
}

/// Live subscription handed to a session.
#[derive(Debug)]
pub struct Attachment {
    /// Sequenced and ephemeral events after the replay.
    pub receiver: mpsc::Receiver<StreamEvent>,
    /// Fanout sequence at attach time.
    pub head: u64,
    /// Catch-up for the requested cursor.
    pub replay: Replay,
}

#[derive(Debug)]
struct BufferedEvent {
    sequence: u64,
    kind: PublishKind,
    message: Message,
    published_at: Instant,
}

#[derive(Debug, Default)]
struct FanoutState {
    head: u64,
    evicted_through: u64,
    buffer: VecDeque<BufferedEvent>,
    subscribers: HashMap<Uuid, mpsc::Sender<StreamEvent>>,
}

/// Broadcast fanout with a bounded replay buffer.
#[derive(Debug)]
pub struct Fanout {
    inner: Mutex<FanoutState>,
    buffer_capacity: usize,
    replay_window: Duration,
    channel_capacity: usize,
}

/// Shared handle to the fanout.
pub type SharedFanout = Arc<Fanout>;

impl Fanout {
    /// Creates an empty fanout.
    #[must_use]
    pub fn new(buffer_capacity: usize, replay_window: Duration, channel_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FanoutState::default()),
            buffer_capacity: buffer_capacity.max(1),
            replay_window,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Creates a fanout from configuration.
    #[must_use]
    pub fn from_config(config: &FanoutConfig) -> Self {
        Self::new(
            config.buffer_capacity,
            config.replay_window(),
            config.channel_capacity,
        )
    }

    /// Last assigned sequence; `0` before the first publish.
    pub async fn head(&self) -> u64 {
        self.inner.lock().await.head
    }

    /// Assigns the next sequence, buffers the event, and delivers it to every
    /// attached session. Sessions that cannot keep up are detached; they
    /// resume with their last sequence and catch up from the buffer.
    pub async fn publish(&self, kind: PublishKind, message: Message) -> u64 {
        let mut state = self.inner.lock().await;
        state.head += 1;
        let sequence = state.head;
        let now = Instant::now();

        state.buffer.push_back(BufferedEvent {
            sequence,
            kind,
            message: message.clone(),
            published_at: now,
        });
        self.evict(&mut state, now);

        let event = StreamEvent {
            sequence: Some(sequence),
            event: kind.event(message),
        };

        let mut dropped = Vec::new();
        for (session_id, sender) in &state.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(%session_id, sequence, "session outbound queue full; detaching");
                    dropped.push(*session_id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*session_id),
            }
        }
        for session_id in &dropped {
            state.subscribers.remove(session_id);
            metrics::counter!("shoutbox_fanout_subscriber_dropped_total").increment(1);
        }

        metrics::counter!("shoutbox_fanout_published_total", "kind" => kind.label()).increment(1);
        metrics::gauge!("shoutbox_fanout_subscribers").set(state.subscribers.len() as f64);
        debug!(
            sequence,
            kind = kind.label(),
            subscribers = state.subscribers.len(),
            "event published"
        );
        sequence
    }

    /// Registers `session_id` for live delivery and returns everything
    /// published after `since`. Without a cursor the whole buffer is replayed.
    /// Re-attaching an existing session replaces its previous subscription.
    pub async fn attach(&self, session_id: Uuid, since: Option<u64>) -> Attachment {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let mut state = self.inner.lock().await;
        self.evict(&mut state, Instant::now());

        let head = state.head;
        let replay = match since {
            Some(cursor) if cursor > head || cursor < state.evicted_through => {
                metrics::counter!("shoutbox_fanout_stale_cursor_total").increment(1);
                debug!(%session_id, cursor, head, evicted_through = state.evicted_through, "stale cursor");
                Replay::Stale
            }
            cursor => {
                let after = cursor.unwrap_or(0);
                let messages = state
                    .buffer
                    .iter()
                    .filter(|entry| entry.sequence > after)
                    .map(|entry| entry.message.clone())
                    .collect();
                Replay::Events {
                    messages,
                    through_sequence: head,
                }
            }
        };

        state.subscribers.insert(session_id, sender);
        metrics::gauge!("shoutbox_fanout_subscribers").set(state.subscribers.len() as f64);

        Attachment {
            receiver,
            head,
            replay,
        }
    }

    /// Stops live delivery to `session_id`. Returns whether it was attached.
    pub async fn detach(&self, session_id: Uuid) -> bool {
        let mut state = self.inner.lock().await;
        let removed = state.subscribers.remove(&session_id).is_some();
        metrics::gauge!("shoutbox_fanout_subscribers").set(state.subscribers.len() as f64);
        removed
    }

    /// Whether `session_id` still has an open outbound channel.
    pub async fn is_attached(&self, session_id: Uuid) -> bool {
        self.inner
            .lock()
            .await
            .subscribers
            .get(&session_id)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Delivers an unsequenced event to a single session.
    pub async fn send_to(&self, session_id: Uuid, event: ShoutboxEvent) -> bool {
        let state = self.inner.lock().await;
        state
            .subscribers
            .get(&session_id)
            .is_some_and(|sender| sender.try_send(StreamEvent::ephemeral(event)).is_ok())
    }

    fn evict(&self, state: &mut FanoutState, now: Instant) {
        while let Some(front) = state.buffer.front() {
            let expired = now.saturating_duration_since(front.published_at) > self.replay_window;
            if state.buffer.len() <= self.buffer_capacity && !expired {
                break;
            }
            state.evicted_through = front.sequence;
            let evicted = state.buffer.pop_front();
            if let Some(evicted) = evicted {
                debug!(
                    sequence = evicted.sequence,
                    kind = evicted.kind.label(),
                    "event evicted from replay buffer"
                );
            }
        }
    }
}
