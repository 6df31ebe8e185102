use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::config::{AuthConfig, AuthKind};
use crate::domain::types::Tool;
use crate::infrastructure::openapi::document::{Document, Operation};

static INVALID_NAME_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\-:]").expect("name charset regex"));

/// Makes a name valid for every LLM provider (Gemini is the strictest):
/// `[A-Za-z0-9_.\-:]`, starting with a letter or underscore, at most 64
/// characters. Over-long names are truncated to 58 characters and suffixed
/// with a stable 5-hex-digit hash of the pre-truncation name.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut name = INVALID_NAME_CHAR.replace_all(name, "_").into_owned();
    if name.is_empty() {
        return "_".to_string();
    }
    let first = name.as_bytes()[0];
    if !first.is_ascii_alphabetic() && first != b'_' {
        name.insert(0, '_');
    }
    if name.len() > 64 {
        let hash = fnv1a32(name.as_bytes()) & 0xF_FFFF;
        // Sanitization leaves only ASCII, so byte truncation is safe.
        name = format!("{}_{hash:05x}", &name[..58]);
    }
    name
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Where an endpoint parameter is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamIn {
    Path,
    Query,
    Header,
}

impl ParamIn {
    fn from_location(location: &str) -> Option<Self> {
        match location {
            "path" => Some(ParamIn::Path),
            "query" => Some(ParamIn::Query),
            "header" => Some(ParamIn::Header),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamIn::Path => "path",
            ParamIn::Query => "query",
            ParamIn::Header => "header",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParamIn,
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
}

/// The HTTP-specific record behind a cataloged tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// Sanitized name used as the tool-name prefix.
    pub target_name: String,
    /// Original configured name, kept for display and config lookups.
    pub target_display_name: String,
    pub base_url: String,
    pub method: String,
    /// Path template with `{name}` placeholders.
    pub path: String,
    /// Module group: OpenAPI tag > first path segment > "default".
    pub group: String,
    pub auth: AuthConfig,
    pub params: Vec<ParamInfo>,
    pub has_body: bool,
}

/// Walks an OpenAPI document and emits one tool descriptor plus endpoint
/// record per operation, followed by the target's synthetic `set_auth` tool.
pub fn build_tools(
    doc: &Document,
    target_name: &str,
    base_url: &str,
    auth: &AuthConfig,
) -> (Vec<Tool>, HashMap<String, Endpoint>) {
    let mut tools = Vec::new();
    let mut endpoints = HashMap::new();

    let sanitized_target = sanitize_target(target_name);

    for (path, item) in &doc.paths {
        for (method, op) in item.operations() {
            let op_id = if op.operation_id.is_empty() {
                generate_op_id(method, path)
            } else {
                op.operation_id.clone()
            };

            let tool_name = sanitize_tool_name(&format!("{sanitized_target}__{op_id}"));

            let description = if !op.summary.is_empty() {
                op.summary.clone()
            } else if !op.description.is_empty() {
                op.description.clone()
            } else {
                format!("{method} {path}")
            };

            let (parameters, params) = build_params(doc, op);

            let endpoint = Endpoint {
                target_name: sanitized_target.clone(),
                target_display_name: target_name.to_string(),
                base_url: base_url.to_string(),
                method: method.to_string(),
                path: path.clone(),
                group: derive_group(op, path),
                auth: auth.clone(),
                params,
                has_body: op.request_body.is_some(),
            };

            tools.push(Tool::function(tool_name.clone(), description, parameters));
            endpoints.insert(tool_name, endpoint);
        }
    }

    tools.push(build_set_auth_tool(target_name, auth));

    (tools, endpoints)
}

/// Sanitizes a target name for use as a tool-name prefix; names that collapse
/// to underscores (for example fully non-ASCII ones) fall back to "target".
pub fn sanitize_target(target_name: &str) -> String {
    let sanitized = sanitize_tool_name(target_name);
    if sanitized.trim_matches('_').is_empty() {
        "target".to_string()
    } else {
        sanitized
    }
}

/// The per-target credential pseudo-tool. When the auth scheme is already
/// known the description spells it out, so the model only has to supply the
/// token. An endpoint whose auth type is still empty is switched to bearer
/// when a token arrives.
pub fn build_set_auth_tool(target_name: &str, auth: &AuthConfig) -> Tool {
    let sanitized = sanitize_target(target_name);

    let mut desc = format!(
        "Set authentication credentials for {target_name}. Call this before making authenticated API requests."
    );
    match auth.kind {
        AuthKind::Bearer => {
            desc.push_str(" This API uses Bearer token authentication; just provide the token.");
        }
        AuthKind::Header => {
            desc.push_str(&format!(
                " This API uses custom header authentication (header: {}); just provide the token, auth_type and header_name are already configured.",
                auth.header_name
            ));
        }
        AuthKind::Query => {
            desc.push_str(&format!(
                " This API uses query parameter authentication (param: {}); just provide the token, auth_type and header_name are already configured.",
                auth.header_name
            ));
        }
        AuthKind::None => {
            desc.push_str(" If no auth type was configured, the token is sent as a Bearer token.");
        }
    }

    Tool::function(
        format!("{sanitized}__set_auth"),
        desc,
        json!({
            "type": "object",
            "properties": {
                "token": {
                    "type": "string",
                    "description": "The authentication token or API key"
                },
                "auth_type": {
                    "type": "string",
                    "enum": ["bearer", "header", "query"],
                    "description": "Authentication type. Usually already configured; only set this to override."
                },
                "header_name": {
                    "type": "string",
                    "description": "Header or query parameter name. Usually already configured; only set this to override."
                }
            },
            "required": ["token"]
        }),
    )
}

fn build_params(doc: &Document, op: &Operation) -> (Value, Vec<ParamInfo>) {
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut params = Vec::new();

    for parameter in &op.parameters {
        let Some(location) = ParamIn::from_location(&parameter.location) else {
            continue;
        };
        if parameter.name.is_empty() {
            continue;
        }

        let mut prop = match &parameter.schema {
            Some(schema) => doc.schema_to_value(schema),
            None => json!({"type": "string"}),
        };
        if !parameter.description.is_empty() {
            prop["description"] = Value::String(format!(
                "{} ({})",
                parameter.description,
                location.as_str()
            ));
        }
        properties.insert(parameter.name.clone(), prop);

        if parameter.required {
            required.push(Value::String(parameter.name.clone()));
        }

        let kind = parameter
            .schema
            .as_ref()
            .map(|schema| doc.resolve(schema).type_name())
            .unwrap_or_else(|| "string".to_string());
        params.push(ParamInfo {
            name: parameter.name.clone(),
            location,
            kind,
            required: parameter.required,
        });
    }

    if let Some(body) = &op.request_body {
        if let Some(schema) = body.first_schema() {
            properties.insert("body".to_string(), doc.schema_to_value(schema));
            if body.required {
                required.push(Value::String("body".to_string()));
            }
        }
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }

    (Value::Object(schema), params)
}

fn generate_op_id(method: &str, path: &str) -> String {
    let stripped: String = path
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    format!(
        "{}_{}",
        method.to_lowercase(),
        stripped.trim_matches('_')
    )
}

/// Module group for an operation: first tag, else first path segment, else
/// "default".
fn derive_group(op: &Operation, path: &str) -> String {
    if let Some(tag) = op.tags.first() {
        if !tag.is_empty() {
            return tag.clone();
        }
    }
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) if idx > 0 => trimmed[..idx].to_string(),
        _ if !trimmed.is_empty() => trimmed.to_string(),
        _ => "default".to_string(),
    }
}

/// Primary auth scheme declared in `components.securitySchemes`.
pub fn detect_auth(doc: &Document) -> (AuthKind, String) {
    for scheme in doc.components.security_schemes.values() {
        match scheme.kind.as_str() {
            "apiKey" => {
                if scheme.location == "header" {
                    return (AuthKind::Header, scheme.name.clone());
                }
                if scheme.location == "query" {
                    return (AuthKind::Query, scheme.name.clone());
                }
            }
            "http" => {
                if scheme.scheme.eq_ignore_ascii_case("bearer") {
                    return (AuthKind::Bearer, String::new());
                }
            }
            _ => {}
        }
    }
    (AuthKind::None, String::new())
}
