use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::catalog::{build_tools, detect_auth, toolset, Endpoint, ToolSet};
use crate::application::prompt::build_system_prompt;
use crate::application::router::ToolRouter;
use crate::config::{AuthKind, Config, DataPaths, TargetConfig};
use crate::domain::types::Tool;
use crate::infrastructure::gateway::{GatewayError, HttpCaller};
use crate::infrastructure::mcp::{mcp_tool_to_llm, McpClient};
use crate::infrastructure::openapi::{discover_spec, load_spec, Document};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Everything startup produces: the aggregated tool catalog, the unified
/// router, the connected subprocess clients and the system prompt.
pub struct Bootstrap {
    pub tools: Vec<Tool>,
    pub caller: Arc<HttpCaller>,
    pub router: Arc<ToolRouter>,
    pub mcp_clients: HashMap<String, Arc<McpClient>>,
    pub system_prompt: String,
}

impl Bootstrap {
    /// Shuts down the subprocess clients.
    pub async fn close(&self) {
        for client in self.mcp_clients.values() {
            client.close().await;
        }
    }
}

/// Full startup assembly. Target and MCP failures are logged and skipped so
/// one broken source never takes the process down.
pub async fn run(cfg: &Config, paths: &DataPaths) -> Result<Bootstrap, BootstrapError> {
    let mut all_tools = Vec::new();
    let mut all_endpoints: HashMap<String, Endpoint> = HashMap::new();

    for target in &cfg.targets {
        match load_target(target, paths).await {
            Some((tools, endpoints)) => {
                info!(target = %target.name, tools = tools.len(), "target loaded");
                all_tools.extend(tools);
                all_endpoints.extend(endpoints);
            }
            None => warn!(target = %target.name, "skipping target"),
        }
    }

    let (mcp_clients, mcp_tools) = init_mcp_clients(cfg).await;
    all_tools.extend(mcp_tools);

    info!(total = all_tools.len(), "tool catalog assembled");

    let caller = Arc::new(HttpCaller::new(all_endpoints)?);
    let router = Arc::new(ToolRouter::new(Arc::clone(&caller), mcp_clients.clone()));
    let system_prompt = build_system_prompt(&cfg.language, &cfg.targets, &all_tools);

    Ok(Bootstrap {
        tools: all_tools,
        caller,
        router,
        mcp_clients,
        system_prompt,
    })
}

/// Loads one target's catalog. Priority: explicit snapshot path, cached
/// snapshot, explicit spec, probe of the base URL. Fresh builds are
/// snapshotted so the next start skips discovery.
async fn load_target(
    target: &TargetConfig,
    paths: &DataPaths,
) -> Option<(Vec<Tool>, HashMap<String, Endpoint>)> {
    if !target.tools.is_empty() {
        match toolset::load(std::path::Path::new(&target.tools)) {
            Ok(snapshot) => return Some(snapshot.build()),
            Err(err) => {
                warn!(target = %target.name, path = %target.tools, %err, "cannot load toolset");
                return None;
            }
        }
    }

    let cached = paths.toolset_path(&target.name);
    if cached.exists() {
        match toolset::load(&cached) {
            Ok(snapshot) => {
                info!(target = %target.name, path = %cached.display(), "catalog restored from snapshot");
                return Some(snapshot.build());
            }
            Err(err) => {
                warn!(target = %target.name, %err, "stale snapshot ignored, rediscovering");
            }
        }
    }

    let doc = fetch_document(target).await?;

    // Config auth wins; an unset auth type falls back to what the spec
    // declares so the set_auth description can name the scheme.
    let mut auth = target.auth.clone();
    if auth.kind == AuthKind::None {
        let (detected, name) = detect_auth(&doc);
        if detected != AuthKind::None {
            auth.kind = detected;
            if auth.header_name.is_empty() {
                auth.header_name = name;
            }
        }
    }

    let (tools, endpoints) = build_tools(&doc, &target.name, &target.base_url, &auth);

    let snapshot = ToolSet::from_parts(&target.name, &target.base_url, &auth, &tools, &endpoints);
    if let Err(err) = toolset::save(&cached, &snapshot) {
        warn!(target = %target.name, %err, "failed to snapshot catalog");
    }

    Some((tools, endpoints))
}

async fn fetch_document(target: &TargetConfig) -> Option<Document> {
    if !target.spec.is_empty() {
        info!(target = %target.name, spec = %target.spec, "loading spec");
        match load_spec(&target.spec).await {
            Ok(doc) => return Some(doc),
            Err(err) => {
                warn!(target = %target.name, %err, "spec load failed");
                return None;
            }
        }
    }

    if !target.base_url.is_empty() {
        info!(target = %target.name, base_url = %target.base_url, "discovering spec");
        match discover_spec(&target.base_url).await {
            Ok((doc, spec_url)) => {
                info!(target = %target.name, %spec_url, "spec discovered");
                return Some(doc);
            }
            Err(err) => {
                warn!(target = %target.name, %err, "spec discovery failed");
                return None;
            }
        }
    }

    None
}

async fn init_mcp_clients(cfg: &Config) -> (HashMap<String, Arc<McpClient>>, Vec<Tool>) {
    let mut clients = HashMap::new();
    let mut tools = Vec::new();

    for client_cfg in &cfg.mcp.clients {
        info!(
            server = %client_cfg.name,
            command = %client_cfg.command,
            "connecting MCP client"
        );
        match McpClient::connect(&client_cfg.name, &client_cfg.command, &client_cfg.args).await {
            Ok(client) => {
                for tool in client.tools() {
                    tools.push(mcp_tool_to_llm(tool, &client_cfg.name));
                }
                info!(server = %client_cfg.name, tools = client.tools().len(), "MCP client ready");
                clients.insert(client_cfg.name.clone(), Arc::new(client));
            }
            Err(err) => {
                warn!(server = %client_cfg.name, %err, "skipping MCP client");
            }
        }
    }

    (clients, tools)
}
