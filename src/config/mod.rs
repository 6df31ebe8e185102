use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_SERVER_PORT: u16 = 9000;
pub const DEFAULT_LANGUAGE: &str = "en";
const CONFIG_FILE_NAME: &str = "toolgate.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write config to {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_yaml::Error),
    #[error("missing required config field: {field}")]
    Missing { field: &'static str },
    #[error("{reason}")]
    Target { reason: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub language: String,
    /// Optional HTTP proxy applied to the LLM client transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Token budget handed to the history truncator; <= 0 disables truncation.
    #[serde(default)]
    pub max_context_tokens: i64,
    /// Defaults to true when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl LlmConfig {
    pub fn stream_enabled(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    /// Explicit OpenAPI document, as a file path or URL.
    #[serde(default)]
    pub spec: String,
    /// Catalog snapshot path; takes priority over `spec` and `base_url`.
    #[serde(default)]
    pub tools: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub kind: AuthKind,
    #[serde(default)]
    pub header_name: String,
    #[serde(default)]
    pub token: String,
}

/// How credentials are attached to outgoing requests for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    #[serde(rename = "")]
    #[serde(alias = "none")]
    None,
    Bearer,
    Header,
    Query,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::None => "",
            AuthKind::Bearer => "bearer",
            AuthKind::Header => "header",
            AuthKind::Query => "query",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub server: McpServerConfig,
    #[serde(default)]
    pub clients: Vec<McpClientConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Port for the MCP SSE re-export; 0 disables it.
    #[serde(default)]
    pub sse_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "reading configuration file");
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.fill_defaults();
        Ok(cfg)
    }

    pub fn fill_defaults(&mut self) {
        if self.language.is_empty() {
            self.language = DEFAULT_LANGUAGE.to_string();
        }
        if self.server.port == 0 {
            self.server.port = DEFAULT_SERVER_PORT;
        }
    }

    /// Chat mode cannot run without an LLM endpoint; the re-export modes can.
    pub fn validate_for_chat(&self) -> Result<(), ConfigError> {
        if self.llm.api_base.is_empty() {
            return Err(ConfigError::Missing {
                field: "llm.api_base",
            });
        }
        if self.llm.model.is_empty() {
            return Err(ConfigError::Missing { field: "llm.model" });
        }
        Ok(())
    }
}

/// Serialized read-modify-write access to the config file, so in-band auth
/// updates and REST edits do not clobber each other.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        Config::load(&self.path)
    }

    /// Loads the config, applies `apply`, fills defaults and writes it back.
    /// Nothing is written when `apply` fails. A missing file starts empty.
    pub fn modify(
        &self,
        apply: impl FnOnce(&mut Config) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut cfg = match Config::load(&self.path) {
            Ok(cfg) => cfg,
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(other) => return Err(other),
        };

        apply(&mut cfg)?;
        cfg.fill_defaults();

        let encoded = serde_yaml::to_string(&cfg).map_err(ConfigError::Encode)?;
        fs::write(&self.path, encoded).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Persists only the token for the named target; unknown targets are a
    /// no-op so in-band `set_auth` never fails a tool call.
    pub fn save_target_token(&self, name: &str, token: &str) -> Result<(), ConfigError> {
        self.modify(|cfg| {
            if let Some(target) = cfg.targets.iter_mut().find(|t| t.name == name) {
                target.auth.token = token.to_string();
                if target.auth.kind == AuthKind::None {
                    target.auth.kind = AuthKind::Bearer;
                }
            }
            Ok(())
        })
    }
}

/// Per-user data layout: config file plus `conversations/`, `toolsets/` and
/// `specs/` directories.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<user config dir>/toolgate`, falling back to the working directory.
    pub fn default_root() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("toolgate"))
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.conversations_dir())?;
        fs::create_dir_all(self.toolsets_dir())?;
        fs::create_dir_all(self.specs_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join("conversations")
    }

    pub fn toolsets_dir(&self) -> PathBuf {
        self.root.join("toolsets")
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.root.join("specs")
    }

    pub fn toolset_path(&self, target: &str) -> PathBuf {
        self.toolsets_dir().join(format!("{}.json", safe_file_stem(target)))
    }
}

/// Target names come from user config and may contain path separators.
fn safe_file_stem(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
language: zh
proxy: http://127.0.0.1:7890
llm:
  api_base: https://api.example.com/v1
  api_key: sk-test
  model: gpt-4o-mini
  max_context_tokens: 8000
targets:
  - name: petstore
    base_url: http://localhost:8080
    auth:
      type: bearer
      token: secret
server:
  port: 9100
mcp:
  server:
    sse_port: 9200
  clients:
    - name: files
      command: mcp-files
      args: ["--root", "/tmp"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.language, "zh");
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.llm.max_context_tokens, 8000);
        assert!(cfg.llm.stream_enabled());
        assert_eq!(cfg.targets.len(), 1);
        assert_eq!(cfg.targets[0].auth.kind, AuthKind::Bearer);
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.mcp.server.sse_port, 9200);
        assert_eq!(cfg.mcp.clients[0].args, vec!["--root", "/tmp"]);
    }

    #[test]
    fn defaults_fill_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toolgate.yaml");
        fs::write(&path, "llm:\n  model: m\n").expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.language, "en");
        assert_eq!(cfg.server.port, DEFAULT_SERVER_PORT);
        assert!(cfg.targets.is_empty());
    }

    #[test]
    fn unparseable_yaml_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toolgate.yaml");
        fs::write(&path, "llm: [unterminated").expect("write");

        match Config::load(&path) {
            Err(ConfigError::Parse { .. }) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn save_target_token_defaults_type_to_bearer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toolgate.yaml");
        fs::write(&path, "targets:\n  - name: petstore\n    base_url: http://x\n").expect("write");

        let store = ConfigStore::new(&path);
        store.save_target_token("petstore", "tok").expect("save");

        let cfg = Config::load(&path).expect("reload");
        assert_eq!(cfg.targets[0].auth.token, "tok");
        assert_eq!(cfg.targets[0].auth.kind, AuthKind::Bearer);
    }

    #[test]
    fn modify_creates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("toolgate.yaml");

        let store = ConfigStore::new(&path);
        store
            .modify(|cfg| {
                cfg.targets.push(TargetConfig {
                    name: "svc".into(),
                    base_url: "http://svc".into(),
                    ..Default::default()
                });
                Ok(())
            })
            .expect("modify");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.targets.len(), 1);
        assert_eq!(cfg.server.port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn toolset_paths_are_sanitized() {
        let paths = DataPaths::new("/tmp/toolgate-test");
        let p = paths.toolset_path("my api/v2");
        assert!(p.ends_with("toolsets/my_api_v2.json"));
    }
}
