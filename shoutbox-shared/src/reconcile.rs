//! Client-side merge of a durable history snapshot with the live stream.
//!
//! Entries are keyed and ordered by message id, so edits never move a message
//! and duplicates delivered by replay or history overlap collapse into one.
//! Avatar enrichment runs beside the view: bodies render immediately and the
//! avatar is patched in once the identity cache answers.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    identity::{AvatarCache, IdentityLookup},
    models::{Message, MessageId, ShoutboxEvent, StreamErrorEvent},
};

/// One rendered row of the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    /// Latest known copy of the message.
    pub message: Message,
    /// Resolved avatar, `None` while enrichment is pending.
    pub avatar_url: Option<String>,
}

/// Effect of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The id was not in the view.
    Inserted,
    /// A newer revision replaced the entry in place.
    Replaced,
    /// The incoming copy was the same or an older revision.
    Unchanged,
}

impl UpsertOutcome {
    /// Whether the view changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Deduplicated, id-ordered set of messages.
#[derive(Debug, Clone, Default)]
pub struct ReconciledView {
    entries: BTreeMap<MessageId, ViewEntry>,
}

impl ReconciledView {
    /// Creates an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an unseen message or replaces a known one when the incoming
    /// revision is strictly newer. Applying the same `(id, revision)` twice is
    /// a no-op.
    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        match self.entries.get_mut(&message.id) {
            None => {
                self.entries.insert(
                    message.id,
                    ViewEntry {
                        message,
                        avatar_url: None,
                    },
                );
                UpsertOutcome::Inserted
            }
            Some(entry) if message.revision > entry.message.revision => {
                entry.message = message;
                UpsertOutcome::Replaced
            }
            Some(_) => UpsertOutcome::Unchanged,
        }
    }

    /// Merges a history snapshot. Live events already merged are kept.
    pub fn initialize(&mut self, history: impl IntoIterator<Item = Message>) -> usize {
        history
            .into_iter()
            .map(|message| self.upsert(message))
            .filter(|outcome| outcome.changed())
            .count()
    }

    /// Visible entries, newest first. Deleted messages are hidden.
    pub fn current_view(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries
            .values()
            .rev()
            .filter(|entry| !entry.message.is_deleted)
    }

    /// Looks up an entry by id, deleted or not.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&ViewEntry> {
        self.entries.get(&id)
    }

    /// Number of visible entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current_view().count()
    }

    /// Whether no entry is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_view().next().is_none()
    }

    /// Distinct authors of the newest `limit` visible messages, newest first.
    ///
    /// This is only an approximation of who is online: it counts people who
    /// spoke recently, not people who are watching.
    #[must_use]
    pub fn recent_authors(&self, limit: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        self.current_view()
            .take(limit)
            .filter(|entry| seen.insert(entry.message.author.clone()))
            .map(|entry| entry.message.author.clone())
            .collect()
    }

    fn set_avatar(&mut self, author: &str, avatar_url: &str) -> usize {
        let mut patched = 0;
        for entry in self
            .entries
            .values_mut()
            .filter(|entry| entry.message.author == author)
        {
            if entry.avatar_url.as_deref() != Some(avatar_url) {
                entry.avatar_url = Some(avatar_url.to_string());
                patched += 1;
            }
        }
        patched
    }
}

/// Avatar resolved in the background for every entry of `username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarPatch {
    /// Author whose entries are patched.
    pub username: String,
    /// Resolved avatar reference.
    pub avatar_url: String,
}

/// What a live event meant for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileSignal {
    /// Messages were merged; `changed` counts entries that actually changed.
    Applied {
        /// Inserted or replaced entries.
        changed: usize,
    },
    /// The session is attached.
    Connected {
        /// Session to heartbeat and to name when submitting.
        session_id: Uuid,
        /// Fanout sequence at attach time.
        head_sequence: u64,
    },
    /// The replay could not be served; re-fetch history and re-initialize.
    ResyncRequired {
        /// Live delivery resumes after this sequence.
        head_sequence: u64,
    },
    /// A submit or edit from this session was rejected.
    Error(StreamErrorEvent),
}

/// [`ReconciledView`] plus asynchronous avatar enrichment.
#[derive(Debug)]
pub struct Reconciler<L> {
    view: ReconciledView,
    avatars: Arc<AvatarCache<L>>,
    pending: HashSet<String>,
    patch_tx: mpsc::UnboundedSender<AvatarPatch>,
    patch_rx: mpsc::UnboundedReceiver<AvatarPatch>,
}

impl<L> Reconciler<L>
where
    L: IdentityLookup + 'static,
{
    /// Creates an empty reconciler resolving avatars through `avatars`.
    pub fn new(avatars: Arc<AvatarCache<L>>) -> Self {
        let (patch_tx, patch_rx) = mpsc::unbounded_channel();
        Self {
            view: ReconciledView::new(),
            avatars,
            pending: HashSet::new(),
            patch_tx,
            patch_rx,
        }
    }

    /// The merged view.
    pub const fn view(&self) -> &ReconciledView {
        &self.view
    }

    /// Merges a newest-first history page. Safe to call again after a resync.
    pub fn initialize(&mut self, snapshot: Vec<Message>) -> usize {
        let authors: HashSet<String> = snapshot.iter().map(|m| m.author.clone()).collect();
        let changed = self.view.initialize(snapshot);
        for author in authors {
            self.enrich(&author);
        }
        debug!(changed, total = self.view.len(), "history snapshot merged");
        changed
    }

    /// Merges one live message.
    pub fn on_live_event(&mut self, message: Message) -> UpsertOutcome {
        let author = message.author.clone();
        let outcome = self.view.upsert(message);
        if outcome == UpsertOutcome::Inserted {
            self.enrich(&author);
        }
        outcome
    }

    /// Dispatches a decoded live-channel event.
    pub fn apply_event(&mut self, event: ShoutboxEvent) -> ReconcileSignal {
        match event {
            ShoutboxEvent::Message { payload } | ShoutboxEvent::MessageUpdated { payload } => {
                let changed = usize::from(self.on_live_event(payload).changed());
                ReconcileSignal::Applied { changed }
            }
            ShoutboxEvent::RecentMessages { payload } => {
                let changed = payload
                    .messages
                    .into_iter()
                    .map(|message| self.on_live_event(message))
                    .filter(|outcome| outcome.changed())
                    .count();
                ReconcileSignal::Applied { changed }
            }
            ShoutboxEvent::Connected { payload } => ReconcileSignal::Connected {
                session_id: payload.session_id,
                head_sequence: payload.head_sequence,
            },
            ShoutboxEvent::Resync { payload } => ReconcileSignal::ResyncRequired {
                head_sequence: payload.head_sequence,
            },
            ShoutboxEvent::Error { payload } => ReconcileSignal::Error(payload),
        }
    }

    /// Applies every avatar patch that has arrived, returning patched entries.
    pub fn apply_patches(&mut self) -> usize {
        let mut patched = 0;
        while let Ok(patch) = self.patch_rx.try_recv() {
            patched += self.apply_patch(&patch);
        }
        patched
    }

    /// Waits for the next avatar patch and applies it with any queued behind it.
    pub async fn next_patches(&mut self) -> usize {
        match self.patch_rx.recv().await {
            Some(patch) => self.apply_patch(&patch) + self.apply_patches(),
            None => 0,
        }
    }

    /// Distinct recent authors; see [`ReconciledView::recent_authors`].
    #[must_use]
    pub fn recent_authors(&self, limit: usize) -> Vec<String> {
        self.view.recent_authors(limit)
    }

    fn apply_patch(&mut self, patch: &AvatarPatch) -> usize {
        self.pending.remove(&patch.username);
        self.view.set_avatar(&patch.username, &patch.avatar_url)
    }

    fn enrich(&mut self, author: &str) {
        if let Some(avatar) = self.avatars.peek(author) {
            self.view.set_avatar(author, &avatar);
            return;
        }
        if !self.pending.insert(author.to_string()) {
            return;
        }

        trace!(author, "resolving avatar in background");
        let avatars = Arc::clone(&self.avatars);
        let tx = self.patch_tx.clone();
        let username = author.to_string();
        tokio::spawn(async move {
            let avatar_url = avatars.resolve(&username).await;
            // The reconciler may already be gone.
            let _ = tx.send(AvatarPatch {
                username,
                avatar_url,
            });
        });
    }
}
