use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::{error_response, AppState};
use crate::models::HealthResponse;

/// GET `/`: liveness probe
pub async fn root_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "message": "Web search chat API is running" }))
}

/// GET `/health`: reports which credentials are present, never their values
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        search_key_configured: state.search_key_configured,
        model_key_configured: state.model_key_configured,
    })
}

/// GET `/api/conversations`: list conversations as JSON
pub async fn list_conversations_handler(State(state): State<AppState>) -> Response {
    match state.chat.get_conversations().await {
        Ok(convs) => Json(convs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/messages`: transcript of one conversation
pub async fn list_messages_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.chat.get_messages(&id).await {
        Ok(msgs) => Json(msgs).into_response(),
        Err(e) => error_response(&e),
    }
}
