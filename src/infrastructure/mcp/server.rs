use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::router::ToolExecutor;

use super::protocol::{
    ContentBlock, InitializeResult, EntityInfo, McpTool, RpcRequest, RpcResponse, ToolCallParams,
    ToolCallResult, ToolsListResult, PROTOCOL_VERSION,
};

/// Per-session buffer between the POST handler and the SSE writer. Overflow
/// drops the slow client's messages rather than blocking request handling.
const SESSION_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum McpServerError {
    #[error("failed to bind MCP SSE listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Re-exports the router's tool surface over the same protocol the
/// subprocess client speaks: line-delimited JSON-RPC on standard streams, or
/// HTTP with a long-lived SSE session per client.
pub struct ReexportServer {
    tools: Vec<McpTool>,
    executor: Arc<dyn ToolExecutor>,
}

impl ReexportServer {
    pub fn new(tools: Vec<McpTool>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self { tools, executor }
    }

    /// Handles one request; notifications return no response.
    pub async fn handle_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    server_info: EntityInfo {
                        name: env!("CARGO_PKG_NAME").to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                    capabilities: json!({"tools": {}}),
                };
                Some(RpcResponse::result(
                    request.id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ))
            }
            "notifications/initialized" => None,
            "tools/list" => {
                let result = ToolsListResult {
                    tools: self.tools.clone(),
                };
                Some(RpcResponse::result(
                    request.id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ))
            }
            "tools/call" => Some(self.handle_tools_call(request).await),
            "ping" => Some(RpcResponse::result(request.id, json!({}))),
            other => {
                debug!(method = other, "unsupported MCP method");
                Some(RpcResponse::error(request.id, -32601, "method not found"))
            }
        }
    }

    async fn handle_tools_call(&self, request: RpcRequest) -> RpcResponse {
        let params: ToolCallParams =
            match serde_json::from_value(request.params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(_) => return RpcResponse::error(request.id, -32602, "invalid params"),
            };

        let args_json = params
            .arguments
            .map(|args| args.to_string())
            .unwrap_or_else(|| "{}".to_string());

        let result = match self.executor.execute(&params.name, &args_json, "").await {
            Ok(output) => ToolCallResult {
                content: vec![ContentBlock::text(output)],
                is_error: false,
            },
            Err(err) => ToolCallResult {
                content: vec![ContentBlock::text(format!("Error: {err}"))],
                is_error: true,
            },
        };

        RpcResponse::result(
            request.id,
            serde_json::to_value(result).unwrap_or(Value::Null),
        )
    }

    /// Serves the protocol over stdin/stdout, one message per line.
    pub async fn run_stdio(&self) -> Result<(), McpServerError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request: RpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    warn!(%err, "invalid JSON-RPC line on stdin");
                    continue;
                }
            };

            if let Some(response) = self.handle_request(request).await {
                let encoded = serde_json::to_string(&response)
                    .unwrap_or_else(|_| r#"{"jsonrpc":"2.0"}"#.to_string());
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }

    /// Serves the protocol over HTTP: `GET /sse` opens a session and streams
    /// responses; clients POST requests to the endpoint announced in the
    /// opening `endpoint` event.
    pub async fn run_sse(self: Arc<Self>, port: u16) -> Result<(), McpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| McpServerError::Bind { addr, source })?;
        self.serve_sse(listener).await
    }

    /// SSE transport on a pre-bound listener.
    pub async fn serve_sse(self: Arc<Self>, listener: TcpListener) -> Result<(), McpServerError> {
        let addr = listener.local_addr().map_err(McpServerError::Io)?;
        let state = SseState {
            server: self,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            port: addr.port(),
        };

        let app = Router::new()
            .route("/sse", get(sse_handler))
            .route("/messages", post(messages_handler))
            .with_state(state);

        info!(%addr, "MCP SSE server listening");
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(McpServerError::Io)
    }
}

#[derive(Clone)]
struct SseState {
    server: Arc<ReexportServer>,
    sessions: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>,
    port: u16,
}

async fn sse_handler(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel::<String>(SESSION_BUFFER);
    state
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(session_id.clone(), tx);
    info!(session_id = %session_id, "MCP SSE session opened");

    let endpoint = format!(
        "http://localhost:{}/messages?sessionId={}",
        state.port, session_id
    );
    let opening =
        futures::stream::once(async move { Ok(Event::default().event("endpoint").data(endpoint)) });
    let replies =
        ReceiverStream::new(rx).map(|msg| Ok(Event::default().event("message").data(msg)));

    Sse::new(opening.chain(replies)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn messages_handler(
    State(state): State<SseState>,
    Query(query): Query<MessagesQuery>,
    Json(request): Json<RpcRequest>,
) -> Response {
    let sender = state
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&query.session_id)
        .cloned();
    let Some(sender) = sender else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response();
    };

    if let Some(response) = state.server.handle_request(request).await {
        let encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"jsonrpc":"2.0"}"#.to_string());
        match sender.try_send(encoded) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %query.session_id, "SSE session buffer full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state
                    .sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&query.session_id);
            }
        }
    }

    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::router::RouterError;
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(
            &self,
            tool_name: &str,
            args_json: &str,
            _auth_token: &str,
        ) -> Result<String, RouterError> {
            if tool_name == "svc__fail" {
                return Err(RouterError::UnknownTool {
                    name: tool_name.to_string(),
                });
            }
            Ok(format!("{tool_name}:{args_json}"))
        }
    }

    fn server() -> ReexportServer {
        let tools = vec![McpTool {
            name: "svc__echo".into(),
            description: "Echo".into(),
            input_schema: json!({"type": "object", "properties": {}}),
        }];
        ReexportServer::new(tools, Arc::new(EchoExecutor))
    }

    #[tokio::test]
    async fn initialize_returns_handshake() {
        let response = server()
            .handle_request(RpcRequest::new(1, "initialize", json!({})))
            .await
            .expect("response");
        let result = response.result.expect("result");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn initialized_notification_has_no_reply() {
        let response = server()
            .handle_request(RpcRequest::notification("notifications/initialized"))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tools_list_returns_catalog() {
        let response = server()
            .handle_request(RpcRequest::new(2, "tools/list", json!({})))
            .await
            .expect("response");
        let result = response.result.expect("result");
        assert_eq!(result["tools"][0]["name"], "svc__echo");
    }

    #[tokio::test]
    async fn tools_call_wraps_result_in_text_block() {
        let mut request = RpcRequest::new(3, "tools/call", json!({}));
        request.params = Some(json!({"name": "svc__echo", "arguments": {"a": 1}}));
        let response = server().handle_request(request).await.expect("response");
        let result = response.result.expect("result");
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "svc__echo:{\"a\":1}");
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn tool_failures_become_error_results() {
        let mut request = RpcRequest::new(4, "tools/call", json!({}));
        request.params = Some(json!({"name": "svc__fail"}));
        let response = server().handle_request(request).await.expect("response");
        let result = response.result.expect("result");
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Error: "));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let response = server()
            .handle_request(RpcRequest::new(5, "resources/list", json!({})))
            .await
            .expect("response");
        assert_eq!(response.error.expect("error").code, -32601);
    }

    #[tokio::test]
    async fn ping_returns_empty_result() {
        let response = server()
            .handle_request(RpcRequest::new(6, "ping", json!({})))
            .await
            .expect("response");
        assert_eq!(response.result, Some(json!({})));
    }
}
