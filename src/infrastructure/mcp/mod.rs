pub mod client;
pub mod protocol;
pub mod server;

pub use client::{McpClient, McpClientError};
pub use protocol::{mcp_tool_to_llm, McpTool, RpcRequest, RpcResponse};
pub use server::{McpServerError, ReexportServer};
