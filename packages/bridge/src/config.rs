//! Runtime configuration, resolved once at startup.

use std::path::PathBuf;
use std::time::Duration;

use agent_bridge_backends::BackendKind;

pub const DEFAULT_PORT: u16 = 18810;
pub const DEFAULT_MAX_SESSIONS: usize = 5;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const SESSIONS_FILE: &str = "bridge-sessions.json";

/// Model id served for the persistent claude backend.
pub const CLAUDE_MODEL_ID: &str = "claude-code";
/// Model id served for the ephemeral codex backend.
pub const CODEX_MODEL_ID: &str = "codex";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub claude_binary: PathBuf,
    pub codex_binary: PathBuf,
    pub mcp_config: Option<PathBuf>,
    pub append_system_prompt: Option<String>,
    pub default_cwd: PathBuf,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub turn_timeout: Duration,
    pub state_dir: PathBuf,
    pub server_url: Option<String>,
    pub bot_token: Option<String>,
    /// Model ids routed to the ephemeral backend; everything else (including
    /// an absent model) is persistent.
    pub ephemeral_models: Vec<String>,
}

impl BridgeConfig {
    /// Classify a requested model onto a backend kind.
    pub fn resolve_backend(&self, model: Option<&str>) -> BackendKind {
        match model {
            Some(model) if !model.is_empty() => {
                if self.ephemeral_models.iter().any(|id| id == model) {
                    BackendKind::Ephemeral
                } else {
                    BackendKind::Persistent
                }
            }
            _ => BackendKind::Persistent,
        }
    }

    /// All model ids the gateway advertises, across both backends.
    pub fn known_models(&self) -> Vec<(String, BackendKind)> {
        let mut models = vec![(CLAUDE_MODEL_ID.to_string(), BackendKind::Persistent)];
        for id in &self.ephemeral_models {
            models.push((id.clone(), BackendKind::Ephemeral));
        }
        models
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.state_dir.join(SESSIONS_FILE)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            claude_binary: PathBuf::from("claude"),
            codex_binary: PathBuf::from("codex"),
            mcp_config: None,
            append_system_prompt: None,
            default_cwd: default_cwd(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            turn_timeout: agent_bridge_backends::claude::DEFAULT_TURN_TIMEOUT,
            state_dir: default_state_dir(),
            server_url: None,
            bot_token: None,
            ephemeral_models: vec![CODEX_MODEL_ID.to_string()],
        }
    }
}

/// `DEFAULT_CWD`, else the OpenClaw workspace, else the process cwd.
pub fn default_cwd() -> PathBuf {
    if let Ok(dir) = std::env::var("DEFAULT_CWD") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(dir) = std::env::var("OPENCLAW_WORKSPACE") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BRIDGE_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("agent-bridge"))
        .unwrap_or_else(|| PathBuf::from(".agent-bridge"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_model_defaults_to_persistent() {
        let config = BridgeConfig::default();
        assert_eq!(config.resolve_backend(None), BackendKind::Persistent);
        assert_eq!(config.resolve_backend(Some("")), BackendKind::Persistent);
    }

    #[test]
    fn ephemeral_models_route_to_ephemeral() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.resolve_backend(Some(CODEX_MODEL_ID)),
            BackendKind::Ephemeral
        );
        assert_eq!(
            config.resolve_backend(Some("claude-code")),
            BackendKind::Persistent
        );
        assert_eq!(
            config.resolve_backend(Some("anything-else")),
            BackendKind::Persistent
        );
    }

    #[test]
    fn known_models_cover_both_backends() {
        let config = BridgeConfig::default();
        let models = config.known_models();
        assert!(models
            .iter()
            .any(|(id, kind)| id == CLAUDE_MODEL_ID && *kind == BackendKind::Persistent));
        assert!(models
            .iter()
            .any(|(id, kind)| id == CODEX_MODEL_ID && *kind == BackendKind::Ephemeral));
    }
}
