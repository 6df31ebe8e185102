use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::types::Tool;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// JSON-RPC 2.0 envelopes. Ids are kept as raw values: we issue numeric ids
// but must echo whatever a peer sends.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    /// A notification carries no id and expects no reply.
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

// MCP payloads.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "serverInfo")]
    pub server_info: EntityInfo,
    #[serde(default)]
    pub capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

// Conversions between the LLM tool shape and the MCP tool shape.

impl From<&Tool> for McpTool {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool.function.parameters.clone(),
        }
    }
}

/// Exposes a child server's tool under the `<source>__<tool>` convention.
pub fn mcp_tool_to_llm(tool: &McpTool, prefix: &str) -> Tool {
    Tool::function(
        format!("{prefix}__{}", tool.name),
        tool.description.clone(),
        tool.input_schema.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_serialize_without_id() {
        let encoded =
            serde_json::to_string(&RpcRequest::notification("notifications/initialized"))
                .expect("encode");
        assert!(!encoded.contains("\"id\""));
        assert!(!encoded.contains("\"params\""));
    }

    #[test]
    fn response_envelope_round_trips() {
        let line = r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
        let resp: RpcResponse = serde_json::from_str(line).expect("decode");
        assert_eq!(resp.id, Some(Value::from(7)));
        assert!(resp.error.is_none());

        let line = r#"{"jsonrpc":"2.0","id":8,"error":{"code":-32601,"message":"nope"}}"#;
        let resp: RpcResponse = serde_json::from_str(line).expect("decode");
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32601));
    }

    #[test]
    fn tool_conversion_applies_prefix() {
        let mcp = McpTool {
            name: "read".into(),
            description: "Read a file".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        };
        let tool = mcp_tool_to_llm(&mcp, "files");
        assert_eq!(tool.name(), "files__read");

        let back = McpTool::from(&tool);
        assert_eq!(back.name, "files__read");
        assert_eq!(back.input_schema, mcp.input_schema);
    }
}
