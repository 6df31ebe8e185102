use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::types::tool_source;
use crate::infrastructure::llm::ChatBackend;

use super::super::state::AppState;

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

pub async fn list<B: ChatBackend + 'static>(State(state): State<Arc<AppState<B>>>) -> Response {
    let tools: Vec<ToolInfo> = state
        .engine
        .tools()
        .iter()
        .map(|tool| ToolInfo {
            name: tool.name().to_string(),
            description: tool.function.description.clone(),
            source: tool_source(tool.name()).to_string(),
            group: state.caller.tool_group(tool.name()),
        })
        .collect();
    Json(tools).into_response()
}

pub async fn sources<B: ChatBackend + 'static>(State(state): State<Arc<AppState<B>>>) -> Response {
    let sources: BTreeSet<String> = state
        .engine
        .tools()
        .iter()
        .map(|tool| tool_source(tool.name()).to_string())
        .collect();
    Json(sources.into_iter().collect::<Vec<_>>()).into_response()
}
