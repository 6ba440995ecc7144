//! Command line entry point and service bootstrap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bot::{self, BotConfig, DEFAULT_RECONNECT_DELAY};
use crate::config::{self, BridgeConfig};
use crate::coordinator::TurnCoordinator;
use crate::persistence::SessionFileStore;
use crate::router::{build_router, AppState};
use crate::sessions::SessionRegistry;

#[derive(Parser, Debug)]
#[command(name = "agent-bridge", bin_name = "agent-bridge")]
#[command(about = "OpenAI-compatible gateway in front of coding-agent CLIs", version)]
pub struct BridgeCli {
    #[arg(long, short = 'H', default_value = "127.0.0.1")]
    host: String,

    #[arg(long, short = 'p', env = "BRIDGE_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Path to the claude CLI (persistent backend).
    #[arg(long, env = "CLAUDE_PATH", default_value = "claude")]
    claude_path: PathBuf,

    /// Path to the codex CLI (ephemeral backend).
    #[arg(long, env = "CODEX_PATH", default_value = "codex")]
    codex_path: PathBuf,

    /// Extra MCP server config passed through to the persistent backend.
    #[arg(long, env = "BRIDGE_MCP_CONFIG")]
    mcp_config: Option<PathBuf>,

    /// Appended to the persistent backend's system prompt.
    #[arg(long)]
    append_system_prompt: Option<String>,

    /// Working directory for new sessions.
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long, env = "MAX_SESSIONS", default_value_t = config::DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = config::DEFAULT_IDLE_TIMEOUT_MS)]
    idle_timeout_ms: u64,

    /// Persistent-backend turn timeout; expiry returns partial output.
    #[arg(long, default_value_t = 600)]
    turn_timeout_secs: u64,

    /// Directory holding bridge-sessions.json.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Chat server to connect the bot channel to.
    #[arg(long, env = "ARINOVA_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "ARINOVA_BOT_TOKEN", hide_env_values = true)]
    bot_token: Option<String>,
}

impl BridgeCli {
    fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            host: self.host,
            port: self.port,
            claude_binary: self.claude_path,
            codex_binary: self.codex_path,
            mcp_config: self.mcp_config,
            append_system_prompt: self.append_system_prompt,
            default_cwd: self.cwd.unwrap_or_else(config::default_cwd),
            max_sessions: self.max_sessions,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            turn_timeout: Duration::from_secs(self.turn_timeout_secs),
            state_dir: self.state_dir.unwrap_or_else(config::default_state_dir),
            server_url: self.server_url,
            bot_token: self.bot_token,
            ephemeral_models: vec![config::CODEX_MODEL_ID.to_string()],
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = BridgeCli::parse();
    init_logging();
    let config = cli.into_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn serve(config: BridgeConfig) -> Result<(), CliError> {
    let store = Arc::new(SessionFileStore::load(config.sessions_file()));
    let registry = Arc::new(SessionRegistry::new(config.clone(), store));
    registry.spawn_sweeper();
    let coordinator = Arc::new(TurnCoordinator::new(registry.clone()));

    match (config.server_url.clone(), config.bot_token.clone()) {
        (Some(server_url), Some(token)) => {
            let bot_config = BotConfig {
                server_url,
                token,
                reconnect_delay: DEFAULT_RECONNECT_DELAY,
            };
            let bot_coordinator = coordinator.clone();
            tokio::spawn(async move {
                bot::run_bot(bot_config, bot_coordinator).await;
            });
        }
        _ => {
            tracing::info!("no bot token configured; ws channel disabled");
        }
    }

    let state = Arc::new(AppState::new(coordinator));
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "bridge listening");

    let shutdown_registry = registry.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down; stopping sessions");
            shutdown_registry.stop_all().await;
        })
        .await
        .map_err(|err| CliError::Server(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cli = BridgeCli::parse_from(["agent-bridge"]);
        let config = cli.into_config();
        assert_eq!(config.port, config::DEFAULT_PORT);
        assert_eq!(config.max_sessions, config::DEFAULT_MAX_SESSIONS);
        assert_eq!(config.turn_timeout, Duration::from_secs(600));
        assert!(config.bot_token.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = BridgeCli::parse_from([
            "agent-bridge",
            "--port",
            "9999",
            "--max-sessions",
            "2",
            "--turn-timeout-secs",
            "30",
            "--claude-path",
            "/opt/bin/claude",
        ]);
        let config = cli.into_config();
        assert_eq!(config.port, 9999);
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.turn_timeout, Duration::from_secs(30));
        assert_eq!(config.claude_binary, PathBuf::from("/opt/bin/claude"));
    }
}
