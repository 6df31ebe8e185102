use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::application::conversations::ConversationError;
use crate::infrastructure::llm::ChatBackend;

use super::super::state::AppState;
use super::error_response;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ToolConfigRequest {
    #[serde(default)]
    pub enabled_sources: Vec<String>,
    #[serde(default)]
    pub disabled_tools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolConfigResponse {
    pub enabled_sources: Vec<String>,
    pub disabled_tools: Vec<String>,
}

pub async fn list<B: ChatBackend + 'static>(State(state): State<Arc<AppState<B>>>) -> Response {
    Json(state.engine.conversations().list()).into_response()
}

pub async fn create<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(request): Json<CreateRequest>,
) -> Response {
    let conv = state
        .engine
        .conversations()
        .create(&request.title, state.engine.system_prompt());
    (StatusCode::CREATED, Json(conv)).into_response()
}

pub async fn get_one<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.conversations().get(&id) {
        Some(conv) => Json(conv).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "conversation not found").into_response(),
    }
}

pub async fn delete<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Response {
    state.engine.conversations().delete(&id);
    StatusCode::NO_CONTENT.into_response()
}

pub async fn get_tools<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.conversations().get(&id) {
        Some(conv) => Json(ToolConfigResponse {
            enabled_sources: conv.enabled_sources,
            disabled_tools: conv.disabled_tools,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "conversation not found").into_response(),
    }
}

pub async fn put_tools<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
    Json(request): Json<ToolConfigRequest>,
) -> Response {
    match state.engine.conversations().update_tool_config(
        &id,
        request.enabled_sources,
        request.disabled_tools,
    ) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => conversation_error(err),
    }
}

pub async fn edit_message<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path((id, index)): Path<(String, usize)>,
    Json(request): Json<EditMessageRequest>,
) -> Response {
    match state
        .engine
        .conversations()
        .edit_message(&id, index, &request.content)
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => conversation_error(err),
    }
}

pub async fn delete_message<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path((id, index)): Path<(String, usize)>,
) -> Response {
    match state.engine.conversations().delete_message(&id, index) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => conversation_error(err),
    }
}

pub async fn delete_messages_from<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path((id, index)): Path<(String, usize)>,
) -> Response {
    match state.engine.conversations().delete_messages_from(&id, index) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => conversation_error(err),
    }
}

fn conversation_error(err: ConversationError) -> Response {
    let status = match err {
        ConversationError::NotFound { .. } => StatusCode::NOT_FOUND,
        ConversationError::InvalidIndex { .. } => StatusCode::BAD_REQUEST,
    };
    error_response(status, err.to_string()).into_response()
}
