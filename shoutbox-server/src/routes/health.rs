use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;

use crate::{app_state::AppState, db::bootstrap};

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

fn record(endpoint: &'static str, status: &'static str) {
    metrics::counter!("health_checks_total", "endpoint" => endpoint, "status" => status)
        .increment(1);
}

async fn healthz() -> impl IntoResponse {
    record("healthz", "ok");
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(pool) = state.pool.as_ref() else {
        record("readyz", "ok");
        return (StatusCode::OK, Json(HealthResponse { status: "ready" }));
    };

    match bootstrap::ensure_readiness(pool).await {
        Ok(()) => {
            record("readyz", "ok");
            (StatusCode::OK, Json(HealthResponse { status: "ready" }))
        }
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            record("readyz", "error");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse { status: "degraded" }),
            )
        }
    }
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
