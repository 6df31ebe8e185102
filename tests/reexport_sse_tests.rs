//! MCP re-export over SSE: session handshake and response delivery.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use toolgate::application::router::{RouterError, ToolExecutor};
use toolgate::infrastructure::mcp::{McpTool, ReexportServer, RpcRequest};

struct EchoExecutor;

#[async_trait]
impl ToolExecutor for EchoExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        _args_json: &str,
        _auth_token: &str,
    ) -> Result<String, RouterError> {
        Ok(format!("echo:{tool_name}"))
    }
}

async fn start_server() -> u16 {
    let tools = vec![McpTool {
        name: "svc__echo".into(),
        description: "Echo".into(),
        input_schema: json!({"type": "object", "properties": {}}),
    }];
    let server = Arc::new(ReexportServer::new(tools, Arc::new(EchoExecutor)));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        server.serve_sse(listener).await.ok();
    });
    port
}

/// Reads SSE frames until one with the wanted event name arrives.
async fn next_event(
    stream: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
    buffer: &mut String,
    wanted: &str,
) -> Option<String> {
    loop {
        if let Some(frame_end) = buffer.find("\n\n") {
            let frame = buffer[..frame_end].to_string();
            buffer.drain(..frame_end + 2);

            let mut event_name = "";
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event_name = rest.trim();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data.push_str(rest);
                }
            }
            if event_name == wanted {
                return Some(data);
            }
            continue;
        }

        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .ok()??
            .ok()?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn session_opens_with_endpoint_event_and_answers_over_the_stream() {
    let port = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://127.0.0.1:{port}/sse"))
        .send()
        .await
        .expect("connect sse");
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    let endpoint = next_event(&mut stream, &mut buffer, "endpoint")
        .await
        .expect("endpoint event");
    assert!(endpoint.contains("/messages?sessionId="));

    // Drive the handshake through the announced endpoint.
    let init = RpcRequest::new(1, "initialize", json!({}));
    let status = client
        .post(&endpoint)
        .json(&init)
        .send()
        .await
        .expect("post initialize")
        .status();
    assert_eq!(status.as_u16(), 202);

    let message = next_event(&mut stream, &mut buffer, "message")
        .await
        .expect("initialize response");
    let parsed: serde_json::Value = serde_json::from_str(&message).expect("json");
    assert_eq!(parsed["id"], 1);
    assert_eq!(parsed["result"]["serverInfo"]["name"], "toolgate");

    // tools/list then tools/call round-trip on the same session.
    let list = RpcRequest::new(2, "tools/list", json!({}));
    client.post(&endpoint).json(&list).send().await.expect("post list");
    let message = next_event(&mut stream, &mut buffer, "message")
        .await
        .expect("list response");
    let parsed: serde_json::Value = serde_json::from_str(&message).expect("json");
    assert_eq!(parsed["result"]["tools"][0]["name"], "svc__echo");

    let mut call = RpcRequest::new(3, "tools/call", json!({}));
    call.params = Some(json!({"name": "svc__echo", "arguments": {}}));
    client.post(&endpoint).json(&call).send().await.expect("post call");
    let message = next_event(&mut stream, &mut buffer, "message")
        .await
        .expect("call response");
    let parsed: serde_json::Value = serde_json::from_str(&message).expect("json");
    assert_eq!(parsed["result"]["content"][0]["text"], "echo:svc__echo");
}

#[tokio::test]
async fn unknown_sessions_are_rejected() {
    let port = start_server().await;
    let client = reqwest::Client::new();

    let request = RpcRequest::new(1, "ping", json!({}));
    let status = client
        .post(format!("http://127.0.0.1:{port}/messages?sessionId=ghost"))
        .json(&request)
        .send()
        .await
        .expect("post")
        .status();
    assert_eq!(status.as_u16(), 404);
}
