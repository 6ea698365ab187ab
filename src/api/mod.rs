#[allow(unused_imports)]
use crate::api::handlers::{
    create_session, get_session_data, handshake, handshake::__path_handshake, health,
    health::__path_health, put_session_data, refresh_session, remove_session,
    session::__path_create_session, session::__path_get_session_data,
    session::__path_put_session_data, session::__path_refresh_session,
    session::__path_remove_session, session::__path_verify_session, verify_session,
};
use crate::config::EngineConfig;
use crate::engine::SessionEngine;
use crate::storage::PostgresStorage;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request},
    routing::{get, post},
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, debug_span, info, warn, Span};
use ulid::Ulid;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

const REAPER_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        handshake,
        create_session,
        verify_session,
        refresh_session,
        remove_session,
        get_session_data,
        put_session_data
    ),
    components(
        schemas(
            handlers::health::Health,
            handlers::handshake::HandshakeRequest,
            handlers::handshake::HandshakeResponse,
            handlers::session::CreateSessionRequest,
            handlers::session::SessionResponse,
            handlers::session::VerifySessionRequest,
            handlers::session::VerifySessionResponse,
            handlers::session::RefreshSessionRequest,
            handlers::session::RemoveSessionRequest,
            handlers::session::RemoveSessionResponse,
            handlers::session::SessionDataResponse,
            handlers::session::PutSessionDataRequest,
            handlers::session::StatusResponse
        )
    ),
    tags(
        (name = "session", description = "Session authentication API"),
        (name = "health", description = "Service health"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Build the application router around a shared engine instance.
pub fn router(engine: Arc<SessionEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(Any);

    Router::new()
        .route("/handshake", post(handlers::handshake))
        .route("/session", post(handlers::create_session))
        .route("/session/verify", post(handlers::verify_session))
        .route("/session/refresh", post(handlers::refresh_session))
        .route("/session/remove", post(handlers::remove_session))
        .route(
            "/session/data",
            get(handlers::get_session_data).put(handlers::put_session_data),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(Arc::clone(&engine))),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(Extension(engine))
}

/// Start the server: connect, migrate, provision the signing key, then bind.
///
/// The signing key is generated and persisted before the listener binds, so
/// the first handshake never races key provisioning.
///
/// # Errors
/// Returns an error if the database, key provisioning, or the listener fails.
pub async fn new(port: u16, dsn: String, config: EngineConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let storage = PostgresStorage::new(pool);
    storage
        .migrate()
        .await
        .context("Failed to run database migrations")?;
    let storage = Arc::new(storage);

    let engine = Arc::new(SessionEngine::new(config, storage.clone()));
    engine
        .warm_up()
        .await
        .context("Failed to provision signing key")?;

    let reaper = tokio::spawn(reap_expired_sessions(storage));

    let app = router(Arc::clone(&engine));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("STARTED, listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    engine.shutdown().await;

    info!("STOPPED");

    Ok(())
}

/// Periodic sweep of expired sessions. Expiry is also enforced lazily at
/// verification and refresh time; this only bounds table growth.
async fn reap_expired_sessions(storage: Arc<PostgresStorage>) {
    use crate::storage::AuthStorage;

    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match storage
            .delete_expired_sessions(crate::engine::unix_ms())
            .await
        {
            Ok(0) => {}
            Ok(reaped) => debug!("Reaped {reaped} expired sessions"),
            Err(err) => warn!("Failed to reap expired sessions: {err}"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!("Failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutting down");
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, ?headers, request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_documents_every_route() {
        let doc = openapi();
        let paths = &doc.paths.paths;
        for path in [
            "/health",
            "/handshake",
            "/session",
            "/session/verify",
            "/session/refresh",
            "/session/remove",
            "/session/data",
        ] {
            assert!(paths.contains_key(path), "missing path {path}");
        }
    }
}
