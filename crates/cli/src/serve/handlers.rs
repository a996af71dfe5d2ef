//! HTTP route handlers: parse, validate, stats, maintenance, health.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use larkline_live::ParseSettings;
use serde::Deserialize;

use super::json_error;
use super::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub(crate) struct ParseRequest {
    grammar: String,
    text: String,
    #[serde(default)]
    settings: ParseSettings,
    /// Live session to record the result on, if it exists
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ValidateRequest {
    grammar: String,
    #[serde(default)]
    settings: ParseSettings,
}

/// Unwrap a JSON body or turn the rejection into a JSON error.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(json_error(rejection.status(), &rejection.body_text()).into_response()),
    }
}

fn check_request(grammar: &str, settings: &ParseSettings) -> Result<(), Response> {
    if grammar.is_empty() {
        return Err(json_error(StatusCode::UNPROCESSABLE_ENTITY, "'grammar' must not be empty").into_response());
    }
    settings
        .validate()
        .map_err(|e| json_error(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()).into_response())
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// POST /api/parse
pub(crate) async fn handle_parse(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ParseRequest>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if let Err(response) = check_request(&request.grammar, &request.settings) {
        return response;
    }
    tracing::info!(
        grammar_bytes = request.grammar.len(),
        text_bytes = request.text.len(),
        parser = %request.settings.parser,
        "parse request"
    );

    match state
        .cache
        .parse_with_cache(&request.grammar, &request.text, &request.settings, true)
        .await
    {
        Ok(result) => {
            tracing::info!(status = result.status().as_str(), parse_time = result.parse_time(), "parse completed");
            if let Some(session) = &request.session_id {
                state.sessions.set_last_result(session, result.clone());
            }
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "parse failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, &format!("parse failed: {}", e)).into_response()
        }
    }
}

/// POST /api/validate
pub(crate) async fn handle_validate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if let Err(response) = check_request(&request.grammar, &request.settings) {
        return response;
    }

    match state.cache.validate_grammar(&request.grammar, &request.settings).await {
        Ok(result) => {
            if !result.is_valid {
                tracing::warn!(errors = result.errors.len(), "grammar validation failed");
            }
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "validation failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, &format!("validation failed: {}", e)).into_response()
        }
    }
}

/// GET /api/stats
pub(crate) async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache.stats();
    let response = serde_json::json!({
        "parse_count": cache.parse_count,
        "cache_size": cache.cache_size,
        "active_parsers": cache.active_parsers,
        "workers": cache.workers,
        "busy_workers": cache.busy_workers,
        "pending_parses": state.coordinator.pending_count(),
        "sessions": state.sessions.stats(),
    });
    (StatusCode::OK, Json(response))
}

/// POST /api/clear-cache
pub(crate) async fn handle_clear_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache.clone();
    tokio::spawn(async move { cache.clear_result_cache() });
    (StatusCode::OK, Json(serde_json::json!({"message": "Cache clear scheduled"})))
}

/// POST /api/cleanup
pub(crate) async fn handle_cleanup(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache.clone();
    tokio::spawn(async move { cache.compact_compiled_parsers() });
    (StatusCode::OK, Json(serde_json::json!({"message": "Parser cleanup scheduled"})))
}

/// GET /api/health
pub(crate) async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache.stats();
    let response = serde_json::json!({
        "status": "healthy",
        "version": VERSION,
        "uptime": state.started.elapsed().as_secs_f64(),
        "active_sessions": state.sessions.stats().active_sessions,
        "total_parses": cache.parse_count,
        "cache_size": cache.cache_size,
    });
    (StatusCode::OK, Json(response))
}

/// GET /api/version
pub(crate) async fn handle_version() -> impl IntoResponse {
    let response = serde_json::json!({
        "version": VERSION,
        "api_version": "v1",
        "parsers": ["earley", "lalr"],
    });
    (StatusCode::OK, Json(response))
}

/// GET /api/sessions/{id}/result
pub(crate) async fn handle_session_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.last_result(&id) {
        Some(result) => (StatusCode::OK, Json(result)).into_response(),
        None => json_error(
            StatusCode::NOT_FOUND,
            &format!("no parse result for session '{}'", id),
        )
        .into_response(),
    }
}
