use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::{counter, gauge};
use shared::{
    config::server::Config,
    models::{
        ConnectedEvent, Message, MessageId, OnlineResponse, RecentMessagesEvent, ResyncEvent,
        ShoutboxEvent,
    },
};
use tokio::{sync::RwLock, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    error::{ShoutboxError, ShoutboxResult},
    fanout::{Attachment, Replay, STALE_CURSOR, SharedFanout, StreamEvent},
    ingestion::{IngestionPipeline, reject},
    rate_limiter::{RateLimitOutcome, RateLimiter},
};

/// One live viewer connection.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    identity: Option<String>,
    last_activity_ms: AtomicU64,
    token: CancellationToken,
}

impl Session {
    /// Session id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Username the session belongs to; `None` for anonymous viewers.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Cancelled when the session is closed.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// A freshly opened session and its live subscription.
#[derive(Debug)]
pub struct OpenedSession {
    /// The session record.
    pub session: Arc<Session>,
    /// Live subscription.
    pub attachment: Attachment,
}

impl OpenedSession {
    /// Events to send before live delivery: the acknowledgement, then either
    /// the replay batch or a resync notice.
    #[must_use]
    pub fn preamble(&self) -> Vec<StreamEvent> {
        let head = self.attachment.head;
        let mut events = vec![StreamEvent::ephemeral(ShoutboxEvent::Connected {
            payload: ConnectedEvent {
                session_id: self.session.id,
                head_sequence: head,
            },
        })];

        match &self.attachment.replay {
            Replay::Stale => events.push(StreamEvent {
                sequence: Some(head),
                event: ShoutboxEvent::Resync {
                    payload: ResyncEvent {
                        reason: STALE_CURSOR.into(),
                        head_sequence: head,
                    },
                },
            }),
            Replay::Events {
                messages,
                through_sequence,
            } if !messages.is_empty() => events.push(StreamEvent {
                sequence: Some(*through_sequence),
                event: ShoutboxEvent::RecentMessages {
                    payload: RecentMessagesEvent {
                        messages: messages.clone(),
                        through_sequence: *through_sequence,
                    },
                },
            }),
            Replay::Events { .. } => {}
        }

        events
    }
}

/// Owns live sessions, gates submissions through the rate limiter, and
/// routes failures back to the session that caused them.
#[derive(Debug)]
pub struct SessionManager {
    fanout: SharedFanout,
    pipeline: IngestionPipeline,
    limiter: RateLimiter,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    idle_timeout: Duration,
    allow_anonymous: bool,
    epoch: Instant,
}

/// Shared handle to the session manager.
pub type SharedSessionManager = Arc<SessionManager>;

impl SessionManager {
    /// Creates a manager with no sessions.
    #[must_use]
    pub fn new(
        fanout: SharedFanout,
        pipeline: IngestionPipeline,
        limiter: RateLimiter,
        idle_timeout: Duration,
        allow_anonymous: bool,
    ) -> Self {
        Self {
            fanout,
            pipeline,
            limiter,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            allow_anonymous,
            epoch: Instant::now(),
        }
    }

    /// Builds a manager from configuration.
    #[must_use]
    pub fn from_config(config: &Config, fanout: SharedFanout, pipeline: IngestionPipeline) -> Self {
        Self::new(
            fanout,
            pipeline,
            RateLimiter::from_config(&config.rate_limits),
            config.sessions.idle_timeout(),
            config.sessions.allow_anonymous,
        )
    }

    /// The fanout sessions attach to.
    #[must_use]
    pub const fn fanout(&self) -> &SharedFanout {
        &self.fanout
    }

    /// The ingestion pipeline submissions go through.
    #[must_use]
    pub const fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// Opens a session and attaches it to live fanout from `since`.
    ///
    /// # Errors
    /// Returns [`ShoutboxError::Authorization`] for anonymous viewers when
    /// they are not allowed.
    #[instrument(name = "sessions.open", skip(self), err)]
    pub async fn open(
        &self,
        identity: Option<String>,
        since: Option<u64>,
    ) -> ShoutboxResult<OpenedSession> {
        if identity.is_none() && !self.allow_anonymous {
            return Err(ShoutboxError::Authorization(
                "anonymous viewers are not allowed".into(),
            ));
        }

        let id = Uuid::new_v4();
        let attachment = self.fanout.attach(id, since).await;
        let session = Arc::new(Session {
            id,
            identity,
            last_activity_ms: AtomicU64::new(self.now_ms()),
            token: CancellationToken::new(),
        });

        let active = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id, Arc::clone(&session));
            sessions.len()
        };
        counter!("shoutbox_sessions_opened_total").increment(1);
        gauge!("shoutbox_sessions_active").set(active as f64);
        info!(
            session_id = %id,
            head = attachment.head,
            stale = matches!(attachment.replay, Replay::Stale),
            "session opened"
        );

        Ok(OpenedSession {
            session,
            attachment,
        })
    }

    /// Closes a session. Closing twice is harmless.
    pub async fn close(&self, session_id: Uuid) -> bool {
        let (removed, active) = {
            let mut sessions = self.sessions.write().await;
            (sessions.remove(&session_id), sessions.len())
        };
        self.fanout.detach(session_id).await;

        let Some(session) = removed else {
            return false;
        };
        session.token.cancel();
        counter!("shoutbox_sessions_closed_total").increment(1);
        gauge!("shoutbox_sessions_active").set(active as f64);
        info!(session_id = %session_id, "session closed");
        true
    }

    /// Closes every session, ending their streams. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
        let mut closed = 0;
        for session_id in ids {
            if self.close(session_id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Records activity. Returns `false` for unknown sessions.
    pub async fn touch(&self, session_id: Uuid) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(&session_id) {
            Some(session) => {
                session
                    .last_activity_ms
                    .store(self.now_ms(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Looks up a session.
    pub async fn session(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Identities with an attached session.
    pub async fn online(&self) -> OnlineResponse {
        let sessions = self.sessions.read().await;
        let mut users: Vec<String> = sessions
            .values()
            .filter_map(|session| session.identity.clone())
            .collect();
        users.sort();
        users.dedup();
        let anonymous = sessions
            .values()
            .filter(|session| session.identity.is_none())
            .count();
        OnlineResponse { users, anonymous }
    }

    /// Validates and rate-limits, then submits a new message for `identity`.
    /// Failures are also delivered to `origin` when it is a session of the
    /// same identity. Invalid bodies do not count against the rate limit.
    ///
    /// # Errors
    /// `Validation` for a bad body, `RateLimited` when the identity's window
    /// is full, otherwise whatever the pipeline reports.
    pub async fn submit(
        &self,
        identity: &str,
        origin: Option<Uuid>,
        body: &str,
    ) -> ShoutboxResult<Message> {
        let result = match self.admit(identity, origin, body).await {
            Ok(()) => self.pipeline.submit(identity, body).await,
            Err(err) => Err(err),
        };
        self.report(identity, origin, result).await
    }

    /// Validates and rate-limits, then applies an edit for `identity`.
    /// Failures are routed like [`SessionManager::submit`].
    ///
    /// # Errors
    /// `Validation` for a bad body, `RateLimited` when the identity's window
    /// is full, otherwise whatever the pipeline reports.
    pub async fn submit_edit(
        &self,
        identity: &str,
        origin: Option<Uuid>,
        message_id: MessageId,
        body: &str,
    ) -> ShoutboxResult<Message> {
        let result = match self.admit(identity, origin, body).await {
            Ok(()) => self.pipeline.submit_edit(identity, message_id, body).await,
            Err(err) => Err(err),
        };
        self.report(identity, origin, result).await
    }

    /// Closes sessions that stopped heartbeating or whose stream is gone.
    pub async fn reap_idle(&self) -> usize {
        let now = self.now_ms();
        let idle_ms = u64::try_from(self.idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let candidates: Vec<Uuid> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|session| {
                    now.saturating_sub(session.last_activity_ms.load(Ordering::Relaxed)) > idle_ms
                })
                .map(|session| session.id)
                .collect()
        };

        let mut dead = candidates;
        for session_id in self.sessions.read().await.keys() {
            if !dead.contains(session_id) && !self.fanout.is_attached(*session_id).await {
                dead.push(*session_id);
            }
        }

        let mut reaped = 0;
        for session_id in dead {
            if self.close(session_id).await {
                reaped += 1;
            }
        }
        let pruned = self.limiter.prune().await;
        if reaped > 0 || pruned > 0 {
            counter!("shoutbox_sessions_reaped_total").increment(reaped as u64);
            debug!(reaped, pruned, "reaper pass finished");
        }
        reaped
    }

    /// Runs [`SessionManager::reap_idle`] every `interval` until `shutdown`.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_idle().await;
                    }
                }
            }
            debug!("session reaper stopped");
        })
    }

    async fn admit(&self, identity: &str, origin: Option<Uuid>, body: &str) -> ShoutboxResult<()> {
        if let Some(session_id) = origin
            && self.owns(identity, session_id).await
        {
            self.touch(session_id).await;
        }
        self.pipeline.validate_body(body).inspect_err(reject)?;
        match self.limiter.acquire(identity).await {
            RateLimitOutcome::Allowed { .. } => Ok(()),
            RateLimitOutcome::Denied { retry_after } => {
                counter!("shoutbox_messages_rejected_total", "code" => "rate_limited")
                    .increment(1);
                Err(ShoutboxError::RateLimited {
                    retry_after_seconds: retry_after,
                })
            }
        }
    }

    async fn report(
        &self,
        identity: &str,
        origin: Option<Uuid>,
        result: ShoutboxResult<Message>,
    ) -> ShoutboxResult<Message> {
        if let (Err(err), Some(session_id)) = (&result, origin)
            && self.owns(identity, session_id).await
        {
            self.fanout.send_to(session_id, err.to_event()).await;
        }
        result
    }

    async fn owns(&self, identity: &str, session_id: Uuid) -> bool {
        self.session(session_id)
            .await
            .is_some_and(|session| session.identity() == Some(identity))
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{fanout::Fanout, store::MemoryMessageStore};
    use shared::models::ErrorCode;
    use tokio::time::timeout;

    fn manager(limit: u32, allow_anonymous: bool) -> SessionManager {
        let fanout = Arc::new(Fanout::new(64, Duration::from_secs(300), 64));
        let pipeline =
            IngestionPipeline::new(Arc::new(MemoryMessageStore::new()), Arc::clone(&fanout), 300);
        SessionManager::new(
            fanout,
            pipeline,
            RateLimiter::new(limit, Duration::from_secs(60)),
            Duration::from_secs(90),
            allow_anonymous,
        )
    }

    async fn next(opened: &mut OpenedSession) -> StreamEvent {
        timeout(Duration::from_secs(1), opened.attachment.receiver.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn anonymous_viewers_follow_configuration() {
        assert!(manager(10, true).open(None, None).await.is_ok());
        let err = manager(10, false).open(None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Authorization);
    }

    #[tokio::test]
    async fn viewer_attached_before_an_edit_sees_it_in_place() {
        let manager = manager(10, true);
        let created = manager.submit("alice", None, "hello").await.unwrap();

        let mut viewer = manager.open(Some("carol".into()), Some(1)).await.unwrap();
        manager
            .submit_edit("alice", None, created.id, "hello world")
            .await
            .unwrap();

        let event = next(&mut viewer).await;
        let ShoutboxEvent::MessageUpdated { payload } = event.event else {
            panic!("expected messageUpdated");
        };
        assert_eq!(payload.id, 1);
        assert_eq!(payload.body, "hello world");
        assert_eq!(event.sequence, Some(2));
    }

    #[tokio::test]
    async fn preamble_acknowledges_then_replays() {
        let manager = manager(10, true);
        manager.submit("alice", None, "one").await.unwrap();
        manager.submit("alice", None, "two").await.unwrap();

        let opened = manager.open(Some("bob".into()), Some(1)).await.unwrap();
        let preamble = opened.preamble();
        assert_eq!(preamble.len(), 2);
        assert_eq!(preamble[0].event.name(), "connected");
        assert_eq!(preamble[1].sequence, Some(2));
        let ShoutboxEvent::RecentMessages { payload } = &preamble[1].event else {
            panic!("expected recentMessages");
        };
        assert_eq!(payload.messages.len(), 1);
        assert_eq!(payload.messages[0].body, "two");
    }

    #[tokio::test]
    async fn stale_cursor_yields_resync() {
        let manager = manager(10, true);
        let opened = manager.open(None, Some(99)).await.unwrap();
        let preamble = opened.preamble();
        assert_eq!(preamble[1].event.name(), "resync");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_boundary_and_error_routing() {
        let manager = manager(3, true);
        let mut origin = manager.open(Some("alice".into()), Some(0)).await.unwrap();
        let mut bystander = manager.open(Some("bob".into()), Some(0)).await.unwrap();
        let origin_id = origin.session.id();

        for n in 0..3 {
            manager
                .submit("alice", Some(origin_id), &format!("m{n}"))
                .await
                .unwrap();
        }
        let err = manager
            .submit("alice", Some(origin_id), "one too many")
            .await
            .unwrap_err();
        assert!(matches!(err, ShoutboxError::RateLimited { retry_after_seconds: 60 }));

        for _ in 0..3 {
            assert_eq!(next(&mut origin).await.event.name(), "message");
            assert_eq!(next(&mut bystander).await.event.name(), "message");
        }
        let error = next(&mut origin).await;
        assert_eq!(error.sequence, None);
        let ShoutboxEvent::Error { payload } = error.event else {
            panic!("expected error event");
        };
        assert_eq!(payload.code, ErrorCode::RateLimited);
        assert!(bystander.attachment.receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_session_does_not_reset_the_window() {
        let manager = manager(1, true);
        let opened = manager.open(Some("alice".into()), None).await.unwrap();
        manager.submit("alice", Some(opened.session.id()), "hi").await.unwrap();
        manager.close(opened.session.id()).await;

        let reopened = manager.open(Some("alice".into()), None).await.unwrap();
        let err = manager
            .submit("alice", Some(reopened.session.id()), "again")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn errors_are_not_routed_to_someone_elses_session() {
        let manager = manager(10, true);
        let mut bob = manager.open(Some("bob".into()), Some(0)).await.unwrap();

        let err = manager
            .submit("alice", Some(bob.session.id()), "")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(bob.attachment.receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_naming_another_users_session_do_not_keep_it_alive() {
        let manager = manager(10, true);
        let bob = manager.open(Some("bob".into()), None).await.unwrap();
        let bob_id = bob.session.id();

        tokio::time::advance(Duration::from_secs(80)).await;
        manager.submit("alice", Some(bob_id), "hi").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(manager.reap_idle().await, 1);
        assert!(manager.session(bob_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn own_writes_count_as_activity() {
        let manager = manager(10, true);
        let alice = manager.open(Some("alice".into()), None).await.unwrap();
        let alice_id = alice.session.id();

        tokio::time::advance(Duration::from_secs(80)).await;
        manager.submit("alice", Some(alice_id), "hi").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(manager.reap_idle().await, 0);
        assert!(manager.session(alice_id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_bodies_do_not_spend_the_rate_window() {
        let manager = manager(1, true);
        let overlong = "a".repeat(301);
        for body in ["", "   ", overlong.as_str()] {
            let err = manager.submit("alice", None, body).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::Validation);
        }
        manager.submit("alice", None, "finally").await.unwrap();
        let err = manager.submit_edit("alice", None, 1, "").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_reaped_and_heartbeats_keep_them() {
        let manager = manager(10, true);
        let idle = manager.open(Some("idle".into()), None).await.unwrap();
        let active = manager.open(Some("active".into()), None).await.unwrap();
        let token = idle.session.cancellation_token();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(manager.touch(active.session.id()).await);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(manager.reap_idle().await, 1);
        assert!(token.is_cancelled());
        assert!(manager.session(idle.session.id()).await.is_none());
        assert!(manager.session(active.session.id()).await.is_some());
    }

    #[tokio::test]
    async fn dropped_streams_are_reaped() {
        let manager = manager(10, true);
        let opened = manager.open(Some("alice".into()), None).await.unwrap();
        let session_id = opened.session.id();
        drop(opened);

        assert_eq!(manager.reap_idle().await, 1);
        assert!(!manager.touch(session_id).await);
    }

    #[tokio::test]
    async fn online_lists_attached_identities() {
        let manager = manager(10, true);
        let _a = manager.open(Some("bob".into()), None).await.unwrap();
        let _b = manager.open(Some("alice".into()), None).await.unwrap();
        let _c = manager.open(Some("alice".into()), None).await.unwrap();
        let _d = manager.open(None, None).await.unwrap();

        let online = manager.online().await;
        assert_eq!(online.users, vec!["alice", "bob"]);
        assert_eq!(online.anonymous, 1);
    }

    #[tokio::test]
    async fn close_all_cancels_every_stream() {
        let manager = manager(10, true);
        let first = manager.open(Some("alice".into()), None).await.unwrap();
        let second = manager.open(None, None).await.unwrap();

        assert_eq!(manager.close_all().await, 2);
        assert!(first.session.cancellation_token().is_cancelled());
        assert!(second.session.cancellation_token().is_cancelled());
        assert_eq!(manager.online().await.anonymous, 0);
    }
}
