use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::catalog::{Endpoint, ParamIn};
use crate::config::AuthKind;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const REACHABILITY_TTL: Duration = Duration::from_secs(30);

/// RFC 3986 unreserved characters stay literal; everything else, including
/// `/`, is escaped when substituted into a path template.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub const SET_AUTH_SUFFIX: &str = "__set_auth";

/// Called after a successful in-band `set_auth` so the token survives
/// process restarts. Receives the target's configured name and the token.
pub type AuthChangedHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("parse arguments: {source}")]
    BadArguments {
        #[source]
        source: serde_json::Error,
    },
    #[error("target server unreachable ({base_url}): {source}")]
    Unreachable {
        base_url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid request URL {url}: {detail}")]
    InvalidUrl { url: String, detail: String },
    #[error("invalid HTTP method {method}")]
    InvalidMethod { method: String },
    #[error("encode request body: {source}")]
    EncodeBody {
        #[source]
        source: serde_json::Error,
    },
    #[error("execute request: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct SetAuthArgs {
    #[serde(default)]
    token: String,
    #[serde(default)]
    auth_type: Option<AuthKind>,
    #[serde(default)]
    header_name: Option<String>,
}

/// Runtime auth state for one target, surfaced by the targets listing.
#[derive(Debug, Clone, Serialize)]
pub struct TargetAuthStatus {
    pub name: String,
    pub auth_type: String,
    pub has_token: bool,
}

/// Executes cataloged HTTP endpoints on the model's behalf.
///
/// One shared client with a cookie jar serves every endpoint, so sessions
/// established by one tool call survive the next. Base URLs are HEAD-probed
/// before the first call and the result cached for thirty seconds.
pub struct HttpCaller {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    client: reqwest::Client,
    probe_client: reqwest::Client,
    reachable: RwLock<HashMap<String, Instant>>,
    reachable_ttl: Duration,
    on_auth_changed: RwLock<Option<AuthChangedHook>>,
}

impl HttpCaller {
    pub fn new(endpoints: HashMap<String, Endpoint>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .cookie_store(true)
            .build()
            .map_err(GatewayError::Client)?;
        let probe_client = reqwest::Client::builder()
            .timeout(REACHABILITY_TIMEOUT)
            .build()
            .map_err(GatewayError::Client)?;
        Ok(Self {
            endpoints: RwLock::new(endpoints),
            client,
            probe_client,
            reachable: RwLock::new(HashMap::new()),
            reachable_ttl: REACHABILITY_TTL,
            on_auth_changed: RwLock::new(None),
        })
    }

    pub fn set_on_auth_changed(&self, hook: AuthChangedHook) {
        *self.on_auth_changed.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn add_endpoints(&self, new: HashMap<String, Endpoint>) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.extend(new);
    }

    /// Drops every endpoint belonging to the given sanitized target name.
    pub fn remove_target(&self, target_name: &str) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.retain(|_, ep| ep.target_name != target_name);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        if name.ends_with(SET_AUTH_SUFFIX) {
            return true;
        }
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn tool_group(&self, name: &str) -> Option<String> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|ep| ep.group.clone())
    }

    /// Auth state per target that declares an auth type; has_token is true
    /// when any endpoint of the target carries one.
    pub fn auth_status(&self) -> Vec<TargetAuthStatus> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        let mut seen: HashMap<String, TargetAuthStatus> = HashMap::new();
        for ep in endpoints.values() {
            if ep.auth.kind == AuthKind::None {
                continue;
            }
            let entry = seen.entry(ep.target_name.clone()).or_insert_with(|| {
                let display = if ep.target_display_name.is_empty() {
                    ep.target_name.clone()
                } else {
                    ep.target_display_name.clone()
                };
                TargetAuthStatus {
                    name: display,
                    auth_type: ep.auth.kind.as_str().to_string(),
                    has_token: false,
                }
            });
            if !ep.auth.token.is_empty() {
                entry.has_token = true;
            }
        }
        seen.into_values().collect()
    }

    /// Executes a cataloged tool and returns the response body as text.
    ///
    /// HTTP statuses >= 400 are not transport errors: the body is returned
    /// as `"HTTP <code>: <body>"` so the model can react to it.
    pub async fn execute(
        &self,
        tool_name: &str,
        args_json: &str,
        caller_token: &str,
    ) -> Result<String, GatewayError> {
        if let Some(target) = tool_name.strip_suffix(SET_AUTH_SUFFIX) {
            return self.set_auth(target, args_json);
        }

        let endpoint = {
            let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
            endpoints
                .get(tool_name)
                .cloned()
                .ok_or_else(|| GatewayError::UnknownTool {
                    name: tool_name.to_string(),
                })?
        };

        self.check_reachable(&endpoint.base_url).await?;

        let mut args = parse_args(args_json)?;

        // Path parameters: escaped substitution, consumed from the argument
        // map. A placeholder the model did not fill stays in the path; the
        // request is still issued so the server can surface the error.
        let mut path = endpoint.path.clone();
        for param in &endpoint.params {
            if param.location == ParamIn::Path {
                if let Some(value) = args.remove(&param.name) {
                    let escaped =
                        utf8_percent_encode(&value_to_string(&value), PATH_SEGMENT).to_string();
                    path = path.replace(&format!("{{{}}}", param.name), &escaped);
                }
            }
        }

        let full_url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), path);
        let mut url =
            reqwest::Url::parse(&full_url).map_err(|err| GatewayError::InvalidUrl {
                url: full_url.clone(),
                detail: err.to_string(),
            })?;

        for param in &endpoint.params {
            if param.location == ParamIn::Query {
                if let Some(value) = args.remove(&param.name) {
                    url.query_pairs_mut()
                        .append_pair(&param.name, &value_to_string(&value));
                }
            }
        }

        // The caller's token overrides the endpoint's stored one. Query-style
        // auth lands on the URL before the request is assembled.
        let token = if caller_token.is_empty() {
            endpoint.auth.token.as_str()
        } else {
            caller_token
        };
        if endpoint.auth.kind == AuthKind::Query
            && !token.is_empty()
            && !endpoint.auth.header_name.is_empty()
        {
            url.query_pairs_mut()
                .append_pair(&endpoint.auth.header_name, token);
        }

        let method = reqwest::Method::from_bytes(endpoint.method.as_bytes()).map_err(|_| {
            GatewayError::InvalidMethod {
                method: endpoint.method.clone(),
            }
        })?;

        let mut request = self
            .client
            .request(method, url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json");

        if endpoint.has_body {
            if let Some(body) = args.get("body") {
                let encoded = serde_json::to_string(body)
                    .map_err(|source| GatewayError::EncodeBody { source })?;
                request = request.body(encoded);
            }
        }

        match endpoint.auth.kind {
            AuthKind::Bearer => {
                if !token.is_empty() {
                    request = request.bearer_auth(token);
                }
            }
            AuthKind::Header => {
                if !token.is_empty() && !endpoint.auth.header_name.is_empty() {
                    request = request.header(endpoint.auth.header_name.as_str(), token);
                }
            }
            AuthKind::Query | AuthKind::None => {}
        }

        for param in &endpoint.params {
            if param.location == ParamIn::Header {
                if let Some(value) = args.get(&param.name) {
                    request = request.header(param.name.as_str(), value_to_string(value));
                }
            }
        }

        debug!(tool = tool_name, url = %url, method = %endpoint.method, "executing HTTP tool");
        let response = request
            .send()
            .await
            .map_err(|source| GatewayError::Request { source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| GatewayError::Request { source })?;

        if status.as_u16() >= 400 {
            return Ok(format!("HTTP {}: {}", status.as_u16(), body));
        }
        Ok(body)
    }

    /// HEAD-probes a base URL unless a success was cached within the TTL.
    /// Any response, including 4xx, counts as reachable.
    async fn check_reachable(&self, base_url: &str) -> Result<(), GatewayError> {
        {
            let cache = self.reachable.read().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = cache.get(base_url) {
                if last.elapsed() < self.reachable_ttl {
                    return Ok(());
                }
            }
        }

        self.probe_client
            .head(base_url)
            .send()
            .await
            .map_err(|source| GatewayError::Unreachable {
                base_url: base_url.to_string(),
                source,
            })?;

        let mut cache = self.reachable.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(base_url.to_string(), Instant::now());
        Ok(())
    }

    /// In-band credential update: stores the token on every endpoint of the
    /// target and fires the persistence hook once. Endpoint auth types that
    /// were empty default to bearer.
    fn set_auth(&self, target_name: &str, args_json: &str) -> Result<String, GatewayError> {
        let args: SetAuthArgs =
            serde_json::from_str(args_json).map_err(|source| GatewayError::BadArguments { source })?;
        if args.token.is_empty() {
            return Ok("Error: token is required".to_string());
        }

        let mut count = 0usize;
        let mut actual_type = AuthKind::None;
        let mut actual_header = String::new();
        let mut config_name = target_name.to_string();
        {
            let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
            for ep in endpoints.values_mut() {
                if ep.target_name != target_name {
                    continue;
                }
                ep.auth.token = args.token.clone();
                match args.auth_type {
                    Some(kind) if kind != AuthKind::None => ep.auth.kind = kind,
                    _ => {
                        if ep.auth.kind == AuthKind::None {
                            ep.auth.kind = AuthKind::Bearer;
                        }
                    }
                }
                if let Some(header_name) = &args.header_name {
                    if !header_name.is_empty() {
                        ep.auth.header_name = header_name.clone();
                    }
                }
                actual_type = ep.auth.kind;
                actual_header = ep.auth.header_name.clone();
                if !ep.target_display_name.is_empty() {
                    config_name = ep.target_display_name.clone();
                }
                count += 1;
            }
        }

        if count == 0 {
            return Ok(format!("No endpoints found for target {target_name:?}"));
        }

        let hook = self
            .on_auth_changed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(&config_name, &args.token);
        } else {
            warn!(target = target_name, "no persistence hook installed for set_auth");
        }

        Ok(format!(
            "Authentication configured: {count} endpoints updated (type={}, param={})",
            actual_type.as_str(),
            actual_header
        ))
    }
}

fn parse_args(args_json: &str) -> Result<Map<String, Value>, GatewayError> {
    if args_json.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(args_json).map_err(|source| GatewayError::BadArguments { source })
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::application::catalog::ParamInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint(name: &str, auth: AuthConfig) -> (String, Endpoint) {
        (
            name.to_string(),
            Endpoint {
                target_name: "svc".into(),
                target_display_name: "service".into(),
                base_url: "http://127.0.0.1:1".into(),
                method: "GET".into(),
                path: "/x".into(),
                group: "default".into(),
                auth,
                params: vec![ParamInfo {
                    name: "id".into(),
                    location: ParamIn::Path,
                    kind: "string".into(),
                    required: true,
                }],
                has_body: false,
            },
        )
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let caller = HttpCaller::new(HashMap::new()).expect("caller");
        let err = caller
            .execute("nope", "{}", "")
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, GatewayError::UnknownTool { .. }));
    }

    #[test]
    fn set_auth_updates_every_endpoint_and_fires_hook_once() {
        let mut endpoints = HashMap::new();
        endpoints.extend([endpoint("svc__a", AuthConfig::default())]);
        endpoints.extend([endpoint("svc__b", AuthConfig::default())]);
        let caller = HttpCaller::new(endpoints).expect("caller");

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new((String::new(), String::new())));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            caller.set_on_auth_changed(Arc::new(move |name, token| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock().unwrap() = (name.to_string(), token.to_string());
            }));
        }

        let result = caller
            .set_auth("svc", r#"{"token":"X"}"#)
            .expect("set_auth");
        assert!(result.contains("2 endpoints updated"));
        assert!(result.contains("type=bearer"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), ("service".to_string(), "X".to_string()));
    }

    #[test]
    fn set_auth_requires_a_token() {
        let caller =
            HttpCaller::new(HashMap::from([endpoint("svc__a", AuthConfig::default())]))
                .expect("caller");
        let result = caller.set_auth("svc", "{}").expect("in-band result");
        assert_eq!(result, "Error: token is required");
    }

    #[test]
    fn set_auth_for_unknown_target_reports_it() {
        let caller = HttpCaller::new(HashMap::new()).expect("caller");
        let result = caller
            .set_auth("ghost", r#"{"token":"X"}"#)
            .expect("in-band result");
        assert!(result.contains("No endpoints found"));
    }

    #[test]
    fn has_tool_claims_set_auth_suffix() {
        let caller = HttpCaller::new(HashMap::new()).expect("caller");
        assert!(caller.has_tool("anything__set_auth"));
        assert!(!caller.has_tool("anything__else"));
    }

    #[test]
    fn path_escaping_covers_separators() {
        let escaped = utf8_percent_encode("a/b c", PATH_SEGMENT).to_string();
        assert_eq!(escaped, "a%2Fb%20c");
    }
}
