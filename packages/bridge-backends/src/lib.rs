//! Child-process backends for the bridge.
//!
//! Two lifecycle strategies share one capability surface: [`ClaudeBackend`]
//! keeps a single long-running child speaking stream-JSON over stdio, while
//! [`CodexBackend`] spawns a fresh `codex exec` child for every turn. Both
//! deliver incremental text through a [`DeltaSink`] and finish with a
//! [`TurnOutcome`].

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use agent_bridge_error::BridgeError;

pub mod claude;
pub mod codex;
pub mod events;

pub use claude::{ClaudeBackend, ClaudeOptions};
pub use codex::{CodexBackend, CodexOptions};

/// Receives incremental response text in event-arrival order.
///
/// Implementations must not block: the reader loops call the sink inline and
/// expect it to be an append to an already-open channel or socket.
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Terminal result of one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    pub final_text: String,
    /// Backend-assigned session/thread id, when one was observed.
    pub session_id: Option<String>,
}

/// Which lifecycle strategy a backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Persistent,
    Ephemeral,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Ephemeral => "ephemeral",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "persistent" => Some(Self::Persistent),
            "ephemeral" => Some(Self::Ephemeral),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete backend bound to a session.
#[derive(Debug)]
pub enum AgentBackend {
    Claude(ClaudeBackend),
    Codex(CodexBackend),
}

impl AgentBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Claude(_) => BackendKind::Persistent,
            Self::Codex(_) => BackendKind::Ephemeral,
        }
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        match self {
            Self::Claude(backend) => backend.start().await,
            Self::Codex(backend) => backend.start(),
        }
    }

    /// Idempotent; bounded-time termination of any child.
    pub async fn stop(&self) {
        match self {
            Self::Claude(backend) => backend.stop().await,
            Self::Codex(backend) => backend.stop(),
        }
    }

    pub async fn restart(&self) -> Result<(), BridgeError> {
        match self {
            Self::Claude(backend) => backend.restart().await,
            Self::Codex(backend) => backend.restart(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Self::Claude(backend) => backend.is_alive(),
            Self::Codex(backend) => backend.is_alive(),
        }
    }

    pub fn is_busy(&self) -> bool {
        match self {
            Self::Claude(backend) => backend.is_busy(),
            Self::Codex(backend) => backend.is_busy(),
        }
    }

    /// Cancel the in-flight turn, keeping the process usable when possible.
    pub fn abort_turn(&self) {
        match self {
            Self::Claude(backend) => backend.abort_turn(),
            Self::Codex(backend) => backend.abort_turn(),
        }
    }

    pub async fn send_message(
        &self,
        text: &str,
        sink: Option<DeltaSink>,
    ) -> Result<TurnOutcome, BridgeError> {
        match self {
            Self::Claude(backend) => backend.send_message(text, sink).await,
            Self::Codex(backend) => backend.send_message(text, sink).await,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        match self {
            Self::Claude(backend) => backend.session_id(),
            Self::Codex(backend) => backend.session_id(),
        }
    }

    pub fn cwd(&self) -> &Path {
        match self {
            Self::Claude(backend) => backend.cwd(),
            Self::Codex(backend) => backend.cwd(),
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Claude(backend) => backend.model(),
            Self::Codex(backend) => backend.model(),
        }
    }

    /// Accumulated spend in USD; zero for backends without cost reporting.
    pub fn total_cost(&self) -> f64 {
        match self {
            Self::Claude(backend) => backend.total_cost(),
            Self::Codex(_) => 0.0,
        }
    }
}

/// Truncate an error/stderr excerpt to a bounded length on a char boundary.
pub(crate) fn truncate_tail(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips() {
        for kind in [BackendKind::Persistent, BackendKind::Ephemeral] {
            assert_eq!(BackendKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(BackendKind::parse("weird"), None);
    }

    #[test]
    fn backend_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BackendKind::Persistent).unwrap(),
            "\"persistent\""
        );
        assert_eq!(
            serde_json::from_str::<BackendKind>("\"ephemeral\"").unwrap(),
            BackendKind::Ephemeral
        );
    }

    #[test]
    fn truncate_tail_bounds_output() {
        let long = "x".repeat(600);
        assert_eq!(truncate_tail(&long, 500).len(), 500);
        assert_eq!(truncate_tail("short", 500), "short");
    }
}
