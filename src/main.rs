use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use toolgate::application::bootstrap::{self, Bootstrap};
use toolgate::application::conversations::ConversationManager;
use toolgate::application::engine::Engine;
use toolgate::application::router::ToolExecutor;
use toolgate::config::{Config, ConfigStore, DataPaths};
use toolgate::domain::types::Tool;
use toolgate::infrastructure::llm::LlmClient;
use toolgate::infrastructure::mcp::{McpTool, ReexportServer};
use toolgate::infrastructure::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "toolgate",
    version,
    about = "Natural-language gateway for HTTP APIs and MCP tool servers"
)]
struct Cli {
    /// Serve the tool surface over MCP on standard streams.
    #[arg(long)]
    mcp: bool,
    /// Serve the tool surface over MCP SSE on the given port.
    #[arg(long, value_name = "PORT")]
    mcp_sse: Option<u16>,
    /// Configuration file; defaults to toolgate.yaml in the data directory.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cli = Cli::parse();

    let paths = DataPaths::default_root();
    paths.ensure()?;

    let config_path = cli.config.unwrap_or_else(|| paths.config_path());
    info!(path = %config_path.display(), "loading configuration");
    let cfg = Config::load(&config_path)?;

    let boot = bootstrap::run(&cfg, &paths).await?;
    info!(tools = boot.tools.len(), "bootstrap complete");

    // Re-export modes stand on the other side of the MCP protocol and need
    // no LLM at all.
    if cli.mcp {
        let reexport = ReexportServer::new(mcp_tools(&boot.tools), executor(&boot));
        let result = reexport.run_stdio().await;
        boot.close().await;
        return Ok(result?);
    }

    if let Some(port) = cli.mcp_sse {
        let reexport = Arc::new(ReexportServer::new(mcp_tools(&boot.tools), executor(&boot)));
        let result = reexport.run_sse(port).await;
        boot.close().await;
        return Ok(result?);
    }

    // Default mode: the chat server.
    cfg.validate_for_chat()?;

    let store = Arc::new(ConfigStore::new(&config_path));
    {
        // Tokens installed in-band survive restarts through the config file.
        let store = Arc::clone(&store);
        boot.caller
            .set_on_auth_changed(Arc::new(move |name, token| {
                if let Err(err) = store.save_target_token(name, token) {
                    warn!(target = name, %err, "failed to persist auth token");
                }
            }));
    }

    let backend = Arc::new(LlmClient::new(
        &cfg.llm.api_base,
        &cfg.llm.api_key,
        &cfg.llm.model,
        cfg.proxy.as_deref(),
        cfg.llm.stream_enabled(),
    )?);
    let conversations = Arc::new(ConversationManager::new(Some(paths.conversations_dir())));
    let engine = Engine::new(
        backend,
        Arc::clone(&boot.router),
        conversations,
        boot.tools.clone(),
        boot.system_prompt.clone(),
        cfg.llm.max_context_tokens,
    );

    if cfg.mcp.server.sse_port > 0 {
        let reexport = Arc::new(ReexportServer::new(mcp_tools(&boot.tools), executor(&boot)));
        let port = cfg.mcp.server.sse_port;
        tokio::spawn(async move {
            if let Err(err) = reexport.run_sse(port).await {
                error!(%err, "MCP SSE server failed");
            }
        });
    }

    let state = Arc::new(AppState::new(
        engine,
        Arc::clone(&boot.caller),
        store,
        paths.clone(),
        cfg.language.clone(),
    ));
    let result = server::serve(state, cfg.server.port).await;

    boot.close().await;
    Ok(result?)
}

fn executor(boot: &Bootstrap) -> Arc<dyn ToolExecutor> {
    Arc::clone(&boot.router) as Arc<dyn ToolExecutor>
}

fn mcp_tools(tools: &[Tool]) -> Vec<McpTool> {
    tools.iter().map(McpTool::from).collect()
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Logs go to stderr so the --mcp stdio protocol owns stdout.
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
