use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseConfig, LogFormat, StorageBackend};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    db::bootstrap,
    middleware::request_context::{RequestContextState, assign_request_context},
    routes::{self, openapi::openapi_routes},
    services::{
        directory::PgUserDirectory,
        session_manager::SharedSessionManager,
        store::PgMessageStore,
    },
    tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|err| {
                    warn!(error = %err, "metrics recorder already installed; exporting nothing");
                    PrometheusBuilder::new().build_recorder().handle()
                })
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the given settings.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let timeout_ms = db.statement_timeout_ms;
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let sql = format!("SET statement_timeout = {timeout_ms}");
                sqlx::query(&sql)
                    .execute(conn)
                    .await
                    .map(|_| ())
            })
        })
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    metrics::gauge!("db_statement_timeout_ms").set(timeout_ms as f64);
    Ok(pool)
}

/// Builds application state for the configured storage backend, running the
/// schema bootstrap when Postgres is selected.
///
/// # Errors
/// Returns an error if the database is unreachable or the bootstrap fails.
pub async fn create_app_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    match config.db.backend {
        StorageBackend::Memory => {
            info!("using in-memory message store");
            Ok(Arc::new(AppState::in_memory(config)))
        }
        StorageBackend::Postgres => {
            let pool = create_database_pool(&config.db)
                .await
                .context("failed to connect to the database")?;
            bootstrap::ensure_liveness(&pool)
                .await
                .context("database liveness check failed")?;
            bootstrap::run(&pool).await?;
            bootstrap::ensure_readiness(&pool)
                .await
                .context("database readiness check failed")?;

            Ok(Arc::new(AppState::build(
                config,
                Some(pool.clone()),
                Arc::new(PgMessageStore::new(pool.clone())),
                Arc::new(PgUserDirectory::new(pool)),
            )))
        }
    }
}

/// Creates the CORS layer for the application.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use http::Method;

    let methods = vec![
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Creates the API router with all route modules.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new().merge(routes::shoutbox::create_router_shoutbox())
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(
    state: Arc<AppState>,
    config: Arc<Config>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let cors = create_cors_layer(&config);
    let request_context_state = RequestContextState::from_config(&config);

    Router::new()
        .nest("/api", create_api_router())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .merge(openapi_routes())
        .with_state(state)
        .layer(Extension(config))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_context_state,
            assign_request_context,
        ))
}

/// Resolves when a shutdown signal is received, then ends every live stream
/// so graceful shutdown does not wait on them.
pub async fn create_shutdown_signal(sessions: SharedSessionManager, reaper: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
    reaper.cancel();
    let closed = sessions.close_all().await;
    info!(closed, "live sessions closed");
}

/// Starts the backend server and binds it to the configured address.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(profile = %config.profile, "Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let state = create_app_state(&config).await?;

    let reaper_token = CancellationToken::new();
    let reaper = state
        .sessions
        .spawn_reaper(config.sessions.reap_interval(), reaper_token.clone());

    let app = create_app_router(Arc::clone(&state), Arc::clone(&config), metrics_handle);

    let host = config.server.host.as_str();
    let listener = TcpListener::bind((host, config.server.port))
        .await
        .with_context(|| format!("failed to bind {host}:{}", config.server.port))?;
    let addr: SocketAddr = listener.local_addr()?;
    info!("Listening on {}", addr);

    let shutdown_signal = create_shutdown_signal(Arc::clone(&state.sessions), reaper_token);

    serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    if let Err(err) = reaper.await {
        warn!(error = %err, "session reaper ended abnormally");
    }

    Ok(())
}
