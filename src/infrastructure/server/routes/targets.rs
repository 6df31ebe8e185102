use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::catalog::{build_tools, builder, detect_auth, toolset, ToolSet};
use crate::config::{AuthConfig, AuthKind, ConfigError, TargetConfig};
use crate::infrastructure::llm::ChatBackend;
use crate::infrastructure::openapi::{discover_spec, load_spec, parse_document};

use super::super::state::AppState;
use super::error_response;

#[derive(Debug, Serialize)]
pub struct TargetInfo {
    pub name: String,
    pub base_url: String,
    pub spec: String,
    pub auth_type: String,
    pub auth_header_name: String,
    pub has_token: bool,
    pub description: String,
    pub tools: usize,
}

#[derive(Debug, Deserialize)]
pub struct AddTargetRequest {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub spec: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub base_url: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ProbeResult {
    pub found: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub spec_url: String,
    pub tools: usize,
    pub endpoints: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadSpecRequest {
    pub filename: String,
    pub content: String,
}

pub async fn list<B: ChatBackend + 'static>(State(state): State<Arc<AppState<B>>>) -> Response {
    let cfg = match state.store.load() {
        Ok(cfg) => cfg,
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                .into_response()
        }
    };

    // Runtime auth state wins over the config file: set_auth may have
    // installed a token since startup.
    let runtime_auth: std::collections::HashMap<String, bool> = state
        .caller
        .auth_status()
        .into_iter()
        .map(|status| (status.name, status.has_token))
        .collect();

    let targets: Vec<TargetInfo> = cfg
        .targets
        .iter()
        .map(|target| {
            let tool_count = toolset::load(&state.paths.toolset_path(&target.name))
                .map(|snapshot| snapshot.endpoints.len())
                .unwrap_or(0);
            let has_runtime_token = runtime_auth.get(&target.name).copied().unwrap_or(false);
            TargetInfo {
                name: target.name.clone(),
                base_url: target.base_url.clone(),
                spec: target.spec.clone(),
                auth_type: target.auth.kind.as_str().to_string(),
                auth_header_name: target.auth.header_name.clone(),
                has_token: has_runtime_token || !target.auth.token.is_empty(),
                description: target.description.clone(),
                tools: tool_count,
            }
        })
        .collect();

    Json(targets).into_response()
}

/// Adds a target to the config and loads its catalog live: endpoints land in
/// the HTTP caller, tools in the engine, and a snapshot on disk.
pub async fn add<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(request): Json<AddTargetRequest>,
) -> Response {
    if request.name.is_empty() || (request.base_url.is_empty() && request.spec.is_empty()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "name and (base_url or spec) are required",
        )
        .into_response();
    }

    let doc = if !request.spec.is_empty() {
        load_spec(&request.spec).await
    } else {
        discover_spec(&request.base_url).await.map(|(doc, _)| doc)
    };
    let doc = match doc {
        Ok(doc) => doc,
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    };

    let mut auth = request.auth.clone();
    if auth.kind == AuthKind::None {
        let (detected, name) = detect_auth(&doc);
        if detected != AuthKind::None {
            auth.kind = detected;
            if auth.header_name.is_empty() {
                auth.header_name = name;
            }
        }
    }

    let saved = state.store.modify(|cfg| {
        if cfg.targets.iter().any(|t| t.name == request.name) {
            return Err(ConfigError::Target {
                reason: "target name already exists",
            });
        }
        cfg.targets.push(TargetConfig {
            name: request.name.clone(),
            base_url: request.base_url.clone(),
            spec: request.spec.clone(),
            tools: String::new(),
            auth: auth.clone(),
            description: request.description.clone(),
        });
        Ok(())
    });
    if let Err(err) = saved {
        return error_response(StatusCode::CONFLICT, err.to_string()).into_response();
    }

    let (tools, endpoints) = build_tools(&doc, &request.name, &request.base_url, &auth);
    let snapshot = ToolSet::from_parts(&request.name, &request.base_url, &auth, &tools, &endpoints);
    if let Err(err) = toolset::save(&state.paths.toolset_path(&request.name), &snapshot) {
        warn!(target = %request.name, %err, "failed to snapshot new target");
    }

    let count = tools.len();
    state.caller.add_endpoints(endpoints);
    state.engine.add_tools(tools);
    info!(target = %request.name, tools = count, "target added");

    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "name": request.name, "tools": count })),
    )
        .into_response()
}

pub async fn remove<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path(name): Path<String>,
) -> Response {
    let removed = state.store.modify(|cfg| {
        let before = cfg.targets.len();
        cfg.targets.retain(|t| t.name != name);
        if cfg.targets.len() == before {
            return Err(ConfigError::Target {
                reason: "target not found",
            });
        }
        Ok(())
    });
    if removed.is_err() {
        return error_response(StatusCode::NOT_FOUND, "target not found").into_response();
    }

    let sanitized = builder::sanitize_target(&name);
    state.caller.remove_target(&sanitized);
    state.engine.remove_tools_with_source(&sanitized);

    let snapshot_path = state.paths.toolset_path(&name);
    if let Err(err) = std::fs::remove_file(&snapshot_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %snapshot_path.display(), %err, "failed to remove snapshot");
        }
    }

    info!(target = %name, "target removed");
    StatusCode::NO_CONTENT.into_response()
}

pub async fn probe<B: ChatBackend + 'static>(
    State(_state): State<Arc<AppState<B>>>,
    Json(request): Json<ProbeRequest>,
) -> Response {
    match discover_spec(&request.base_url).await {
        Ok((doc, spec_url)) => {
            let result = preview(&doc, spec_url);
            Json(result).into_response()
        }
        Err(err) => Json(ProbeResult {
            found: false,
            error: err.to_string(),
            ..Default::default()
        })
        .into_response(),
    }
}

/// Stores an uploaded OpenAPI document under `specs/` and returns a preview
/// of the tools it would produce.
pub async fn upload_spec<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(request): Json<UploadSpecRequest>,
) -> Response {
    let doc = match parse_document(&request.filename, request.content.as_bytes()) {
        Ok(doc) => doc,
        Err(err) => {
            return Json(ProbeResult {
                found: false,
                error: err.to_string(),
                ..Default::default()
            })
            .into_response()
        }
    };

    let mut stem: String = request
        .filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.trim_matches(|c| c == '.' || c == '_').is_empty() {
        stem = "uploaded.json".to_string();
    }
    let path = state.paths.specs_dir().join(&stem);
    if let Err(err) = std::fs::write(&path, &request.content) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            .into_response();
    }

    Json(preview(&doc, path.display().to_string())).into_response()
}

fn preview(doc: &crate::infrastructure::openapi::Document, spec_url: String) -> ProbeResult {
    let (tools, _) = build_tools(doc, "_probe", "", &AuthConfig::default());
    let endpoints = tools
        .iter()
        .map(|tool| format!("{}: {}", tool.name(), tool.function.description))
        .collect();
    let (auth_kind, auth_name) = detect_auth(doc);

    ProbeResult {
        found: true,
        spec_url,
        tools: tools.len(),
        endpoints,
        auth_type: auth_kind.as_str().to_string(),
        auth_name,
        error: String::new(),
    }
}
