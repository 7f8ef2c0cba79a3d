use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use shared::{
    identity::{IdentityError, IdentityLookup},
    models::{ApiProblem, HistoryPage, Message, MessageId, ShoutboxSettings, UserProfile},
};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Header the server trusts for the caller's username.
pub const USER_HEADER: &str = "x-shoutbox-user";
/// Header naming the live session that should receive error events.
pub const SESSION_HEADER: &str = "x-shoutbox-session";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{problem} (HTTP {status})")]
    Problem {
        status: StatusCode,
        problem: ApiProblem,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("a username is required; pass --user or set SHOUTBOX_USER")]
    MissingUser,
}

impl ClientError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Problem { problem, .. } => problem.is_retryable(),
            Self::Transport(_) => true,
            Self::Url(_) | Self::MissingUser => false,
        }
    }

    /// Seconds the server asked us to wait, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::Problem { problem, .. } => problem.retry_after_seconds(),
            _ => None,
        }
    }
}

/// Thin REST client for the shoutbox API.
#[derive(Debug, Clone)]
pub struct ShoutboxClient {
    http: Client,
    api: Url,
    user: Option<String>,
    session: Option<Uuid>,
}

impl ShoutboxClient {
    pub fn new(server: &str, user: Option<String>) -> Result<Self, ClientError> {
        let mut base = Url::parse(server)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            api: base.join("api/")?,
            user: user.filter(|name| !name.trim().is_empty()),
            session: None,
        })
    }

    /// Names the live session that should receive error events for writes.
    #[must_use]
    pub fn with_session(mut self, session: Option<Uuid>) -> Self {
        self.session = session;
        self
    }

    pub async fn history(
        &self,
        limit: Option<usize>,
        before: Option<MessageId>,
    ) -> Result<HistoryPage, ClientError> {
        let mut url = self.endpoint("shoutbox/history")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(before) = before {
                query.append_pair("before", &before.to_string());
            }
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Limits and display defaults the server was configured with.
    pub async fn settings(&self) -> Result<ShoutboxSettings, ClientError> {
        let response = self
            .http
            .get(self.endpoint("shoutbox/settings")?)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn submit(&self, body: &str) -> Result<Message, ClientError> {
        let user = self.require_user()?;
        let request = self
            .http
            .post(self.endpoint("shoutbox/messages")?)
            .header(USER_HEADER, user)
            .json(&json!({ "body": body }));
        let response = self.with_session_header(request).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn edit(&self, id: MessageId, body: &str) -> Result<Message, ClientError> {
        let user = self.require_user()?;
        let request = self
            .http
            .patch(self.endpoint(&format!("shoutbox/messages/{id}"))?)
            .header(USER_HEADER, user)
            .json(&json!({ "body": body }));
        let response = self.with_session_header(request).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Looks up a public profile; `None` when the user is unknown.
    pub async fn profile(&self, username: &str) -> Result<Option<UserProfile>, ClientError> {
        let mut url = self.endpoint("users/")?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(username);
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    /// Keeps a live session alive. `false` when the server no longer knows it.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<bool, ClientError> {
        let url = self.endpoint(&format!("shoutbox/sessions/{session_id}/heartbeat"))?;
        let response = self.authorized(self.http.post(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    pub async fn close_session(&self, session_id: Uuid) -> Result<(), ClientError> {
        let url = self.endpoint(&format!("shoutbox/sessions/{session_id}"))?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
        }
        Ok(())
    }

    /// Builds the live stream request, resuming from `last_event_id` when
    /// present and from the history `cursor` otherwise.
    pub fn stream(
        &self,
        cursor: u64,
        last_event_id: Option<&str>,
    ) -> Result<RequestBuilder, ClientError> {
        let mut url = self.endpoint("shoutbox/stream")?;
        url.query_pairs_mut()
            .append_pair("since", &cursor.to_string());
        let mut request = self
            .authorized(self.http.get(url))
            .header("Accept", "text/event-stream");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }
        Ok(request)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.api.join(path)?)
    }

    fn require_user(&self) -> Result<&str, ClientError> {
        self.user.as_deref().ok_or(ClientError::MissingUser)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.user {
            Some(user) => request.header(USER_HEADER, user),
            None => request,
        }
    }

    fn with_session_header(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session {
            Some(session) => request.header(SESSION_HEADER, session.to_string()),
            None => request,
        }
    }
}

/// Resolves avatars through `GET /api/users/{username}`.
#[derive(Debug, Clone)]
pub struct HttpIdentityLookup {
    client: ShoutboxClient,
}

impl HttpIdentityLookup {
    pub const fn new(client: ShoutboxClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityLookup for HttpIdentityLookup {
    async fn lookup(&self, username: &str) -> Result<Option<UserProfile>, IdentityError> {
        self.client
            .profile(username)
            .await
            .map_err(|err| IdentityError::Lookup(err.to_string()))
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ClientError::Problem {
        status,
        problem: decode_problem(status, &text),
    })
}

fn decode_problem(status: StatusCode, body: &str) -> ApiProblem {
    serde_json::from_str(body).unwrap_or_else(|_| ApiProblem {
        code: status
            .canonical_reason()
            .unwrap_or("http_error")
            .to_lowercase()
            .replace(' ', "_"),
        message: if body.trim().is_empty() {
            format!("server responded with {status}")
        } else {
            body.trim().to_string()
        },
        details: None,
    })
}
