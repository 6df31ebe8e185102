use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::agent::{AgentEvent, ConfirmHook, LoopError};
use crate::infrastructure::llm::ChatBackend;

use super::super::state::{AppState, ChatSession};
use super::error_response;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    pub from_index: usize,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub session_id: String,
    pub approved: bool,
}

enum Run {
    Chat {
        conversation_id: String,
        message: String,
    },
    Regenerate {
        conversation_id: String,
        from_index: usize,
    },
}

pub async fn chat<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is required").into_response();
    }

    let auth_token = bearer_token(&headers);
    run_stream(
        state,
        auth_token,
        Run::Chat {
            conversation_id: request.conversation_id,
            message: request.message,
        },
    )
    .into_response()
}

pub async fn regenerate<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RegenerateRequest>,
) -> Response {
    let auth_token = bearer_token(&headers);
    run_stream(
        state,
        auth_token,
        Run::Regenerate {
            conversation_id: id,
            from_index: request.from_index,
        },
    )
    .into_response()
}

pub async fn stop<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(request): Json<StopRequest>,
) -> Response {
    if state.cancel_session(&request.session_id) {
        info!(session = %request.session_id, "chat session canceled");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found").into_response()
    }
}

pub async fn confirm<B: ChatBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(request): Json<ConfirmRequest>,
) -> Response {
    if state.answer_confirmation(&request.session_id, request.approved) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found").into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

/// Drives one agent run in a background task and streams its events back as
/// SSE. The stream opens with a `session` event carrying the id used by the
/// stop and confirm endpoints, and always closes with `done`.
fn run_stream<B: ChatBackend + 'static>(
    state: Arc<AppState<B>>,
    auth_token: String,
    run: Run,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().simple().to_string();
    let cancel = CancellationToken::new();
    let (confirm_tx, confirm_rx) = mpsc::channel(1);
    state.register_session(
        &session_id,
        ChatSession {
            cancel: cancel.clone(),
            confirm_tx,
        },
    );

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let _ = tx.send(named_event("session", json!({ "session_id": session_id })));

    tokio::spawn({
        let session_id = session_id.clone();
        async move {
            let events = tx.clone();
            let on_event = move |event: AgentEvent| {
                let _ = events.send(named_event(event.name(), event.payload()));
            };
            let confirm = SseConfirm {
                session_id: session_id.clone(),
                events: tx.clone(),
                answers: tokio::sync::Mutex::new(confirm_rx),
                cancel: cancel.clone(),
            };

            let outcome = match run {
                Run::Chat {
                    conversation_id,
                    message,
                } => {
                    state
                        .engine
                        .chat(
                            &cancel,
                            &conversation_id,
                            &message,
                            &auth_token,
                            Some(&confirm),
                            &on_event,
                        )
                        .await
                }
                Run::Regenerate {
                    conversation_id,
                    from_index,
                } => {
                    match state
                        .engine
                        .regenerate_from(
                            &cancel,
                            &conversation_id,
                            from_index,
                            &auth_token,
                            Some(&confirm),
                            &on_event,
                        )
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            let _ = tx.send(named_event("error", json!({ "error": err.to_string() })));
                            let _ = tx.send(named_event("done", json!({ "conversation_id": conversation_id })));
                            state.drop_session(&session_id);
                            return;
                        }
                    }
                }
            };

            match &outcome.error {
                // Cancellation is a normal termination; partial progress was
                // already persisted by the engine.
                None | Some(LoopError::Canceled) => {}
                Some(err) => {
                    let _ = tx.send(named_event("error", json!({ "error": err.to_string() })));
                }
            }

            let mut done = json!({ "conversation_id": outcome.conversation_id });
            if !outcome.usage.is_zero() {
                done["usage"] = serde_json::to_value(outcome.usage).unwrap_or_default();
            }
            let _ = tx.send(named_event("done", done));

            state.drop_session(&session_id);
            debug!(session = %session_id, "chat stream finished");
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default())
}

fn named_event(name: &str, payload: serde_json::Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

/// Forwards a `tool_confirm` event to the client and blocks until the
/// approval endpoint answers or the session is canceled.
struct SseConfirm {
    session_id: String,
    events: mpsc::UnboundedSender<Event>,
    answers: tokio::sync::Mutex<mpsc::Receiver<bool>>,
    cancel: CancellationToken,
}

#[async_trait]
impl ConfirmHook for SseConfirm {
    async fn confirm(&self, tool_name: &str, args_json: &str) -> bool {
        let payload = json!({
            "session_id": self.session_id,
            "name": tool_name,
            "arguments": args_json,
        });
        let _ = self.events.send(named_event("tool_confirm", payload));

        let mut answers = self.answers.lock().await;
        tokio::select! {
            answer = answers.recv() => answer.unwrap_or(false),
            _ = self.cancel.cancelled() => false,
        }
    }
}
