use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

use crate::infrastructure::llm::ChatBackend;

use super::super::state::AppState;

pub async fn health<B: ChatBackend + 'static>(State(state): State<Arc<AppState<B>>>) -> Response {
    Json(json!({ "status": "ok", "tools": state.engine.tools().len() })).into_response()
}

pub async fn info<B: ChatBackend + 'static>(State(state): State<Arc<AppState<B>>>) -> Response {
    Json(json!({
        "language": state.language,
        "tools": state.engine.tools().len(),
    }))
    .into_response()
}
