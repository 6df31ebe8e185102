use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::domain::types::Tool;

use super::builder::{build_set_auth_tool, sanitize_target, Endpoint, ParamInfo};

pub const TOOLSET_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ToolSetError {
    #[error("failed to read toolset {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write toolset {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode toolset {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("toolset {path:?} has unsupported version {found} (expected {TOOLSET_VERSION})")]
    Version { path: PathBuf, found: u32 },
    #[error("failed to encode toolset: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Versioned catalog snapshot for one target: everything needed to rebuild
/// the target's tools without contacting the origin server again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSet {
    pub version: u32,
    pub target: String,
    pub base_url: String,
    pub auth: AuthConfig,
    pub endpoints: Vec<ToolSetEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSetEndpoint {
    pub name: String,
    pub description: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub params: Vec<ParamInfo>,
    #[serde(default)]
    pub has_body: bool,
    /// The tool descriptor's JSON-Schema parameters, verbatim.
    pub parameters: Value,
}

impl ToolSet {
    /// Snapshots a freshly built catalog. The synthetic `set_auth` tool is
    /// not stored; `build` re-injects it.
    pub fn from_parts(
        target: &str,
        base_url: &str,
        auth: &AuthConfig,
        tools: &[Tool],
        endpoints: &HashMap<String, Endpoint>,
    ) -> Self {
        let snapshot_endpoints = tools
            .iter()
            .filter_map(|tool| {
                let ep = endpoints.get(tool.name())?;
                Some(ToolSetEndpoint {
                    name: tool.name().to_string(),
                    description: tool.function.description.clone(),
                    method: ep.method.clone(),
                    path: ep.path.clone(),
                    group: ep.group.clone(),
                    params: ep.params.clone(),
                    has_body: ep.has_body,
                    parameters: tool.function.parameters.clone(),
                })
            })
            .collect();

        Self {
            version: TOOLSET_VERSION,
            target: target.to_string(),
            base_url: base_url.to_string(),
            auth: auth.clone(),
            endpoints: snapshot_endpoints,
        }
    }

    /// Reconstructs tool descriptors and endpoint records, re-injecting the
    /// target's `set_auth` tool.
    pub fn build(&self) -> (Vec<Tool>, HashMap<String, Endpoint>) {
        let sanitized_target = sanitize_target(&self.target);

        let mut tools = Vec::with_capacity(self.endpoints.len() + 1);
        let mut endpoints = HashMap::with_capacity(self.endpoints.len());

        for ep in &self.endpoints {
            tools.push(Tool::function(
                ep.name.clone(),
                ep.description.clone(),
                ep.parameters.clone(),
            ));
            endpoints.insert(
                ep.name.clone(),
                Endpoint {
                    target_name: sanitized_target.clone(),
                    target_display_name: self.target.clone(),
                    base_url: self.base_url.clone(),
                    method: ep.method.clone(),
                    path: ep.path.clone(),
                    group: ep.group.clone(),
                    auth: self.auth.clone(),
                    params: ep.params.clone(),
                    has_body: ep.has_body,
                },
            );
        }

        tools.push(build_set_auth_tool(&self.target, &self.auth));

        (tools, endpoints)
    }
}

pub fn save(path: &Path, toolset: &ToolSet) -> Result<(), ToolSetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ToolSetError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let encoded = serde_json::to_string_pretty(toolset).map_err(ToolSetError::Encode)?;
    fs::write(path, encoded).map_err(|source| ToolSetError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load(path: &Path) -> Result<ToolSet, ToolSetError> {
    let raw = fs::read(path).map_err(|source| ToolSetError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let toolset: ToolSet =
        serde_json::from_slice(&raw).map_err(|source| ToolSetError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if toolset.version != TOOLSET_VERSION {
        return Err(ToolSetError::Version {
            path: path.to_path_buf(),
            found: toolset.version,
        });
    }
    Ok(toolset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::catalog::builder::build_tools;
    use crate::config::AuthKind;
    use crate::infrastructure::openapi::parse_document;
    use std::collections::BTreeSet;

    fn sample_catalog() -> (Vec<Tool>, HashMap<String, Endpoint>, AuthConfig) {
        let raw = serde_json::json!({
            "openapi": "3.0.0",
            "paths": {
                "/items": {
                    "get": {"operationId": "listItems", "summary": "List items"},
                    "post": {
                        "operationId": "createItem",
                        "requestBody": {
                            "required": true,
                            "content": {"application/json": {"schema": {"type": "object"}}}
                        }
                    }
                },
                "/items/{id}": {
                    "delete": {
                        "operationId": "deleteItem",
                        "parameters": [
                            {"name": "id", "in": "path", "required": true,
                             "schema": {"type": "string"}}
                        ]
                    }
                }
            }
        });
        let doc = parse_document("test", raw.to_string().as_bytes()).expect("parse");
        let auth = AuthConfig {
            kind: AuthKind::Bearer,
            header_name: String::new(),
            token: "tok".into(),
        };
        let (tools, endpoints) = build_tools(&doc, "inventory", "http://inv:8080", &auth);
        (tools, endpoints, auth)
    }

    #[test]
    fn round_trip_preserves_tools_and_endpoints() {
        let (tools, endpoints, auth) = sample_catalog();
        let snapshot = ToolSet::from_parts("inventory", "http://inv:8080", &auth, &tools, &endpoints);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inventory.json");
        save(&path, &snapshot).expect("save");
        let restored = load(&path).expect("load");
        let (rebuilt_tools, rebuilt_endpoints) = restored.build();

        let names: BTreeSet<&str> = tools.iter().map(Tool::name).collect();
        let rebuilt_names: BTreeSet<&str> = rebuilt_tools.iter().map(Tool::name).collect();
        assert_eq!(names, rebuilt_names);

        for (name, original) in &endpoints {
            let rebuilt = rebuilt_endpoints.get(name).expect("endpoint survives");
            assert_eq!(rebuilt.method, original.method);
            assert_eq!(rebuilt.path, original.path);
            assert_eq!(rebuilt.params, original.params);
            assert_eq!(rebuilt.has_body, original.has_body);
            assert_eq!(rebuilt.auth, original.auth);
        }

        for tool in &tools {
            let rebuilt = rebuilt_tools
                .iter()
                .find(|t| t.name() == tool.name())
                .expect("tool survives");
            assert_eq!(rebuilt.function.parameters, tool.function.parameters);
        }
    }

    #[test]
    fn build_reinjects_set_auth() {
        let (tools, endpoints, auth) = sample_catalog();
        let snapshot = ToolSet::from_parts("inventory", "http://inv:8080", &auth, &tools, &endpoints);
        // set_auth never lands in the snapshot endpoint list.
        assert!(snapshot.endpoints.iter().all(|ep| !ep.name.ends_with("__set_auth")));

        let (rebuilt_tools, _) = snapshot.build();
        assert!(rebuilt_tools.iter().any(|t| t.name() == "inventory__set_auth"));
    }

    #[test]
    fn version_mismatch_is_recoverable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("old.json");
        fs::write(
            &path,
            r#"{"version": 99, "target": "t", "base_url": "", "auth": {"type": "", "header_name": "", "token": ""}, "endpoints": []}"#,
        )
        .expect("write");

        match load(&path) {
            Err(ToolSetError::Version { found, .. }) => assert_eq!(found, 99),
            other => panic!("expected version error, got {other:?}"),
        }
    }
}
