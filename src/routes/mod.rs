pub mod api_routes;
pub mod stream_routes;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::errors::AppError;
use crate::service::chat_service::ChatService;
use crate::service::rate_limiter::RateLimiter;

use self::api_routes::{health_handler, list_conversations_handler, list_messages_handler, root_handler};
use self::stream_routes::chat_stream_handler;

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub rate_limiter: Arc<RateLimiter>,
    pub search_key_configured: bool,
    pub model_key_configured: bool,
}

/// All routes, without the HTTP middleware layers added in `main`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/chat_stream/{message}", get(chat_stream_handler))
        .route("/api/conversations", get(list_conversations_handler))
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .with_state(state)
}

/// Maps errors raised before a stream opens to a JSON error response.
pub fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_rate_limited() {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
