//! `larkline serve` -- HTTP JSON API and live parsing WebSocket.
//!
//! Endpoints:
//! - POST /api/parse                  - Parse text with a grammar
//! - POST /api/validate               - Check that a grammar compiles
//! - GET  /api/stats                  - Parser cache and session statistics
//! - POST /api/clear-cache            - Drop cached parse results (background)
//! - POST /api/cleanup                - Compact compiled parsers (background)
//! - GET  /api/health                 - Server status
//! - GET  /api/version                - Version information
//! - GET  /api/sessions/{id}/result   - Last parse result of a live session
//! - GET  /ws/parsing                 - Live parsing protocol
//!
//! All HTTP responses use Content-Type: application/json.

mod handlers;
mod state;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use larkline_live::{Coordinator, LiveConfig, ParserCache, SessionStore};
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_cleanup, handle_clear_cache, handle_health, handle_not_found, handle_parse, handle_session_result,
    handle_stats, handle_validate, handle_version,
};
use self::state::AppState;
use self::ws::handle_ws;

/// Room for JSON framing around the grammar and text.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Assemble the application router around `state`.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .config
        .max_grammar_size
        .saturating_add(state.config.max_text_length)
        .saturating_add(BODY_OVERHEAD);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/parse", post(handle_parse))
        .route("/api/validate", post(handle_validate))
        .route("/api/stats", get(handle_stats))
        .route("/api/clear-cache", post(handle_clear_cache))
        .route("/api/cleanup", post(handle_cleanup))
        .route("/api/health", get(handle_health))
        .route("/api/version", get(handle_version))
        .route("/api/sessions/{id}/result", get(handle_session_result))
        .route("/ws/parsing", get(handle_ws))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(config: LiveConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(ParserCache::new(&config));
    let sessions = Arc::new(SessionStore::new(&config));
    let coordinator = Arc::new(Coordinator::new(
        cache.clone(),
        sessions.clone(),
        config.debounce_delay,
    ));
    sessions.start_reaper();

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        config,
        cache: cache.clone(),
        sessions: sessions.clone(),
        coordinator: coordinator.clone(),
        started: Instant::now(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "larkline listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown();
    sessions.shutdown().await;
    cache.close();
    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
