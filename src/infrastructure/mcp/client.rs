use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::protocol::{
    McpTool, RpcRequest, RpcResponse, ToolCallResult, ToolsListResult, PROTOCOL_VERSION,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum McpClientError {
    #[error("spawn {server}: {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{server}: {message}")]
    Transport { server: String, message: String },
    #[error("{server}: RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("{server}: request timed out")]
    Timeout { server: String },
    #[error("{server}: connection closed")]
    Closed { server: String },
    #[error("{server}: decode response: {source}")]
    Decode {
        server: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON-RPC 2.0 client over a child process's standard streams.
///
/// One message per line. A single reader task owns stdout and resolves
/// requests through a shared pending table keyed by numeric id; writes to
/// stdin are serialized behind a mutex. When the reader sees EOF it marks
/// the connection closed and fails every in-flight request.
pub struct McpClient {
    name: String,
    tools: Vec<McpTool>,
    inner: Arc<ClientInner>,
    child: AsyncMutex<Child>,
}

struct ClientInner {
    name: String,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<RpcResponse>>>,
    next_id: AtomicI64,
    done: watch::Receiver<bool>,
}

impl McpClient {
    /// Spawns the configured command, performs the MCP handshake and caches
    /// the child's tool list.
    pub async fn connect(
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<Self, McpClientError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| McpClientError::Spawn {
                server: name.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| McpClientError::Transport {
            server: name.to_string(),
            message: "failed to capture child stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpClientError::Transport {
            server: name.to_string(),
            message: "failed to capture child stdout".to_string(),
        })?;

        let (done_tx, done_rx) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            name: name.to_string(),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            done: done_rx,
        });

        tokio::spawn(reader_loop(Arc::clone(&inner), stdout, done_tx));

        let mut client = Self {
            name: name.to_string(),
            tools: Vec::new(),
            inner,
            child: AsyncMutex::new(child),
        };

        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&mut self) -> Result<(), McpClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.inner.send("initialize", params).await?;
        self.inner
            .notify("notifications/initialized")
            .await?;

        let result = self.inner.send("tools/list", json!({})).await?;
        let listed: ToolsListResult =
            serde_json::from_value(result).map_err(|source| McpClientError::Decode {
                server: self.name.clone(),
                source,
            })?;
        debug!(server = %self.name, tools = listed.tools.len(), "MCP handshake complete");
        self.tools = listed.tools;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    /// Invokes a tool on the child and returns the concatenated text content
    /// blocks of its result.
    pub async fn call_tool(&self, name: &str, args_json: &str) -> Result<String, McpClientError> {
        let arguments: Value = if args_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(args_json).unwrap_or_else(|_| json!({}))
        };

        let result = self
            .inner
            .send("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;

        let call: ToolCallResult =
            serde_json::from_value(result).map_err(|source| McpClientError::Decode {
                server: self.name.clone(),
                source,
            })?;

        let texts: Vec<&str> = call
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        Ok(texts.join("\n"))
    }

    /// Closes stdin so the child sees EOF, then waits for it to exit.
    pub async fn close(&self) {
        {
            let mut writer = self.inner.writer.lock().await;
            writer.take();
        }
        let mut child = self.child.lock().await;
        if let Err(err) = child.wait().await {
            warn!(server = %self.name, %err, "waiting for MCP child failed");
        }
    }
}

impl ClientInner {
    async fn send(&self, method: &str, params: Value) -> Result<Value, McpClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id, tx);
        }

        let request = RpcRequest::new(id, method, params);
        if let Err(err) = self.write_line(&request).await {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id);
            return Err(err);
        }

        let mut done = self.done.clone();
        let response = tokio::select! {
            response = rx => match response {
                Ok(response) => response,
                Err(_) => {
                    return Err(McpClientError::Closed {
                        server: self.name.clone(),
                    })
                }
            },
            _ = tokio::time::sleep(RPC_TIMEOUT) => {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&id);
                return Err(McpClientError::Timeout {
                    server: self.name.clone(),
                });
            }
            _ = done.wait_for(|closed| *closed) => {
                return Err(McpClientError::Closed {
                    server: self.name.clone(),
                })
            }
        };

        if let Some(error) = response.error {
            return Err(McpClientError::Rpc {
                server: self.name.clone(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str) -> Result<(), McpClientError> {
        self.write_line(&RpcRequest::notification(method)).await
    }

    async fn write_line(&self, request: &RpcRequest) -> Result<(), McpClientError> {
        let encoded = serde_json::to_string(request).map_err(|source| McpClientError::Decode {
            server: self.name.clone(),
            source,
        })?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| McpClientError::Closed {
            server: self.name.clone(),
        })?;

        let write = async {
            stream.write_all(encoded.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        };
        write.await.map_err(|err| McpClientError::Transport {
            server: self.name.clone(),
            message: format!("write: {err}"),
        })
    }
}

async fn reader_loop(inner: Arc<ClientInner>, stdout: ChildStdout, done: watch::Sender<bool>) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response: RpcResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(err) => {
                warn!(server = %inner.name, %err, "invalid JSON from MCP server");
                continue;
            }
        };

        // Notifications and peer-initiated requests carry no matching id.
        let Some(id) = response.id.as_ref().and_then(Value::as_i64) else {
            continue;
        };

        let sender = {
            let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id)
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => {
                debug!(server = %inner.name, id, "response for unknown request id");
            }
        }
    }

    let _ = done.send(true);
    // Dropping the senders wakes every waiter with a Closed error.
    let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
    pending.clear();
    debug!(server = %inner.name, "MCP reader loop terminated");
}
