//! End-to-end tests for the shoutbox HTTP surface on the in-memory backend.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, BodyDataStream},
    http::{HeaderName, HeaderValue, Request, StatusCode},
};
use axum_test::TestServer;
use futures::StreamExt;
use serde_json::{Value, json};
use server::{
    app_state::AppState,
    server::{create_app_router, metrics_handle},
};
use shared::{
    config::server::{Config, Profile},
    models::{HistoryPage, Message, OnlineResponse, ShoutboxSettings, UserProfile},
};
use tower::ServiceExt;

const USER: HeaderName = HeaderName::from_static("x-shoutbox-user");

fn test_config() -> Config {
    let mut config = Config::default_for_profile(Profile::Test);
    config
        .directory
        .avatars
        .insert("alice".into(), "/avatars/alice.png".into());
    config
}

fn app(config: Config) -> Router {
    let config = Arc::new(config);
    let state = Arc::new(AppState::in_memory(&config));
    create_app_router(state, config, metrics_handle())
}

fn test_server(config: Config) -> TestServer {
    TestServer::new(app(config)).unwrap()
}

fn as_user(name: &'static str) -> HeaderValue {
    HeaderValue::from_static(name)
}

async fn post(server: &TestServer, user: &'static str, body: &str) -> axum_test::TestResponse {
    server
        .post("/api/shoutbox/messages")
        .add_header(USER, as_user(user))
        .json(&json!({ "body": body }))
        .await
}

fn stream_request(uri: &str, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .header("x-shoutbox-user", "bob");
    if let Some(id) = last_event_id {
        builder = builder.header("last-event-id", id);
    }
    builder.body(Body::empty()).unwrap()
}

/// Reads from an open event stream until `done` accepts the text so far.
async fn read_until(frames: &mut BodyDataStream, text: &mut String, done: impl Fn(&str) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(text.as_str()) {
            let chunk = frames
                .next()
                .await
                .expect("stream ended early")
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("stream produced the expected frames");
}

async fn open_stream(router: Router, request: Request<Body>) -> BodyDataStream {
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    response.into_body().into_data_stream()
}

/// Reads SSE frames until `done` accepts the accumulated text.
async fn read_stream_until(
    router: Router,
    request: Request<Body>,
    done: impl Fn(&str) -> bool,
) -> String {
    let mut frames = open_stream(router, request).await;
    let mut text = String::new();
    read_until(&mut frames, &mut text, done).await;
    text
}

#[tokio::test]
async fn submitted_messages_show_up_in_history_for_everyone() {
    let server = test_server(test_config());

    let response = post(&server, "alice", "hello").await;
    response.assert_status(StatusCode::CREATED);
    let created: Message = response.json();
    assert_eq!(created.author, "alice");
    assert_eq!(created.revision, 0);
    assert!(created.edited_at.is_none());

    let page: HistoryPage = server
        .get("/api/shoutbox/history")
        .add_header(USER, as_user("bob"))
        .await
        .json();
    assert_eq!(page.messages, vec![created]);
    assert_eq!(page.cursor, 1);
    assert!(!page.has_more);
}

#[tokio::test]
async fn only_the_author_may_edit() {
    let server = test_server(test_config());
    let created: Message = post(&server, "alice", "hello").await.json();

    let denied = server
        .patch(&format!("/api/shoutbox/messages/{}", created.id))
        .add_header(USER, as_user("bob"))
        .json(&json!({ "body": "hijacked" }))
        .await;
    denied.assert_status(StatusCode::FORBIDDEN);
    assert_eq!(denied.json::<Value>()["code"], "authorization_error");

    let edited: Message = server
        .patch(&format!("/api/shoutbox/messages/{}", created.id))
        .add_header(USER, as_user("alice"))
        .json(&json!({ "body": "hello, edited" }))
        .await
        .json();
    assert_eq!(edited.id, created.id);
    assert_eq!(edited.body, "hello, edited");
    assert_eq!(edited.revision, 1);
    assert!(edited.is_edited());

    let missing = server
        .patch("/api/shoutbox/messages/9999")
        .add_header(USER, as_user("alice"))
        .json(&json!({ "body": "anyone there" }))
        .await;
    missing.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn body_length_is_bounded_in_characters() {
    let server = test_server(test_config());

    post(&server, "alice", &"é".repeat(300))
        .await
        .assert_status(StatusCode::CREATED);

    let rejected = post(&server, "alice", &"a".repeat(301)).await;
    rejected.assert_status(StatusCode::BAD_REQUEST);
    let problem: Value = rejected.json();
    assert_eq!(problem["code"], "validation_error");
    assert_eq!(problem["status"], 400);

    post(&server, "alice", "   ")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn writes_without_identity_are_unauthorized() {
    let server = test_server(test_config());

    server
        .post("/api/shoutbox/messages")
        .json(&json!({ "body": "who am i" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .patch("/api/shoutbox/messages/1")
        .json(&json!({ "body": "who am i" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rate_limited_submissions_carry_retry_after() {
    let mut config = test_config();
    config.rate_limits.messages_per_window = 2;
    let server = test_server(config);

    for body in ["one", "two"] {
        post(&server, "alice", body)
            .await
            .assert_status(StatusCode::CREATED);
    }

    let limited = post(&server, "alice", "three").await;
    limited.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));
    assert_eq!(limited.json::<Value>()["code"], "rate_limited");

    post(&server, "bob", "unaffected")
        .await
        .assert_status(StatusCode::CREATED);
}

#[tokio::test]
async fn history_pages_with_a_before_cursor() {
    let server = test_server(test_config());
    for n in 1..=5 {
        post(&server, "alice", &format!("message {n}")).await;
    }

    let first: HistoryPage = server
        .get("/api/shoutbox/history")
        .add_query_param("limit", 2)
        .await
        .json();
    let ids: Vec<i64> = first.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![5, 4]);
    assert!(first.has_more);

    let older: HistoryPage = server
        .get("/api/shoutbox/history")
        .add_query_param("limit", 10)
        .add_query_param("before", 4)
        .await
        .json();
    let ids: Vec<i64> = older.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert!(!older.has_more);
}

#[tokio::test]
async fn stream_replays_messages_after_the_cursor() {
    let router = app(test_config());
    let server = TestServer::new(router.clone()).unwrap();
    post(&server, "alice", "before attach").await;

    let text = read_stream_until(
        router,
        stream_request("/api/shoutbox/stream?since=0", None),
        |text| text.contains("event: recentMessages") && text.contains("before attach"),
    )
    .await;

    assert!(text.contains("event: connected"));
    assert!(text.contains("id: sb-1"));
}

#[tokio::test]
async fn stale_last_event_id_triggers_resync() {
    let router = app(test_config());

    let text = read_stream_until(
        router,
        Request::builder()
            .uri("/api/shoutbox/stream")
            .header("last-event-id", "sb-99")
            .body(Body::empty())
            .unwrap(),
        |text| text.contains("event: resync"),
    )
    .await;

    assert!(text.contains("stale_cursor"));
}

#[tokio::test]
async fn anonymous_streams_are_refused_when_disabled() {
    let mut config = test_config();
    config.sessions.allow_anonymous = false;
    let server = test_server(config);

    server
        .get("/api/shoutbox/stream")
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_sessions_cannot_be_heartbeated_or_closed() {
    let server = test_server(test_config());
    let session = uuid::Uuid::new_v4();

    server
        .post(&format!("/api/shoutbox/sessions/{session}/heartbeat"))
        .add_header(USER, as_user("alice"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .delete(&format!("/api/shoutbox/sessions/{session}"))
        .add_header(USER, as_user("alice"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let online: OnlineResponse = server.get("/api/shoutbox/online").await.json();
    assert!(online.users.is_empty());
    assert_eq!(online.anonymous, 0);
}

#[tokio::test]
async fn user_profiles_come_from_the_directory() {
    let server = test_server(test_config());

    let alice: UserProfile = server.get("/api/users/alice").await.json();
    assert_eq!(alice.avatar_url.as_deref(), Some("/avatars/alice.png"));

    let bob: UserProfile = server.get("/api/users/bob").await.json();
    assert_eq!(bob.username, "bob");
    assert!(bob.avatar_url.is_none());
}

#[tokio::test]
async fn openapi_documents_are_served() {
    let server = test_server(test_config());

    let json: Value = server.get("/openapi/shoutbox.json").await.json();
    assert!(json["paths"]["/api/shoutbox/stream"].is_object());

    let yaml = server.get("/openapi/shoutbox.yaml").await;
    yaml.assert_status_ok();
    assert!(yaml.text().contains("/api/shoutbox/history"));
}

#[tokio::test]
async fn problems_use_the_problem_json_content_type() {
    let server = test_server(test_config());
    let response = post(&server, "alice", "").await;
    assert_eq!(
        response.header("content-type"),
        HeaderValue::from_static("application/problem+json")
    );
}

#[tokio::test]
async fn live_events_arrive_in_order_with_sequenced_ids() {
    let router = app(test_config());
    let server = TestServer::new(router.clone()).unwrap();

    let mut frames = open_stream(
        router.clone(),
        stream_request("/api/shoutbox/stream?since=0", None),
    )
    .await;
    let mut text = String::new();
    read_until(&mut frames, &mut text, |text| text.contains("event: connected")).await;

    let created: Message = post(&server, "alice", "draft").await.json();
    server
        .patch(&format!("/api/shoutbox/messages/{}", created.id))
        .add_header(USER, as_user("alice"))
        .json(&json!({ "body": "final" }))
        .await
        .assert_status_ok();

    read_until(&mut frames, &mut text, |text| {
        text.contains("event: messageUpdated") && text.contains("final")
    })
    .await;

    let created_at = text.find("event: message\n").expect("message frame");
    let updated_at = text.find("event: messageUpdated").expect("messageUpdated frame");
    assert!(created_at < updated_at);
    let first_id = text.find("id: sb-1\n").expect("id of the submit");
    let second_id = text.find("id: sb-2\n").expect("id of the edit");
    assert!(first_id < second_id);
    assert!(text.contains("draft"));
}

#[tokio::test]
async fn resuming_with_last_event_id_replays_only_missed_events() {
    let router = app(test_config());
    let server = TestServer::new(router.clone()).unwrap();

    let mut frames = open_stream(
        router.clone(),
        stream_request("/api/shoutbox/stream?since=0", None),
    )
    .await;
    let mut text = String::new();
    read_until(&mut frames, &mut text, |text| text.contains("event: connected")).await;
    let created: Message = post(&server, "alice", "draft").await.json();
    read_until(&mut frames, &mut text, |text| text.contains("id: sb-1")).await;
    drop(frames);

    server
        .patch(&format!("/api/shoutbox/messages/{}", created.id))
        .add_header(USER, as_user("alice"))
        .json(&json!({ "body": "final" }))
        .await
        .assert_status_ok();

    let resumed = read_stream_until(
        router,
        stream_request("/api/shoutbox/stream", Some("sb-1")),
        |text| text.contains("event: recentMessages") && text.contains("final"),
    )
    .await;
    assert!(resumed.contains("id: sb-2"));
    assert!(!resumed.contains("id: sb-1"));
    assert!(!resumed.contains("draft"));
    assert!(!resumed.contains("event: resync"));
}

async fn problem_body(response: axum::response::Response) -> Value {
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn malformed_requests_are_problem_documents() {
    let router = app(test_config());

    let response = router
        .clone()
        .oneshot(
            Request::post("/api/shoutbox/messages")
                .header("x-shoutbox-user", "alice")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(problem_body(response).await["code"], "validation_error");

    let response = router
        .clone()
        .oneshot(
            Request::patch("/api/shoutbox/messages/abc")
                .header("x-shoutbox-user", "alice")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"body":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(problem_body(response).await["status"], 400);

    let response = router
        .oneshot(
            Request::get("/api/shoutbox/history?limit=lots")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(problem_body(response).await["code"], "validation_error");
}

#[tokio::test]
async fn settings_expose_configured_display_defaults() {
    let mut config = test_config();
    config.directory.default_avatar = "/img/anon.svg".into();
    config.directory.cache_ttl_seconds = 45;
    let server = test_server(config);

    let settings: ShoutboxSettings = server.get("/api/shoutbox/settings").await.json();
    assert_eq!(settings.default_avatar, "/img/anon.svg");
    assert_eq!(settings.avatar_ttl_seconds, 45);
    assert_eq!(settings.max_body_chars, 300);
}

#[tokio::test]
async fn another_users_session_cannot_be_heartbeated() {
    let router = app(test_config());
    let server = TestServer::new(router.clone()).unwrap();

    let mut frames = open_stream(
        router,
        stream_request("/api/shoutbox/stream?since=0", None),
    )
    .await;
    let mut text = String::new();
    read_until(&mut frames, &mut text, |text| {
        text.contains("head_sequence") && text.ends_with("\n\n")
    })
    .await;
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("connected payload");
    let connected: Value = serde_json::from_str(data).unwrap();
    let session_id = connected["payload"]["session_id"].as_str().unwrap().to_string();

    server
        .post(&format!("/api/shoutbox/sessions/{session_id}/heartbeat"))
        .add_header(USER, as_user("alice"))
        .await
        .assert_status(StatusCode::FORBIDDEN);
    server
        .post(&format!("/api/shoutbox/sessions/{session_id}/heartbeat"))
        .add_header(USER, as_user("bob"))
        .await
        .assert_status(StatusCode::NO_CONTENT);
}
