//! Per-request glue between the frontends and the session layer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use agent_bridge_backends::{DeltaSink, TurnOutcome};
use agent_bridge_error::BridgeError;

use crate::commands;
use crate::sessions::{CreateOptions, Session, SessionRegistry};

/// One inbound message, from either frontend.
pub struct TurnRequest {
    pub conversation_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub sink: Option<DeltaSink>,
    /// Trips to `true` when the caller goes away.
    pub cancel: Option<watch::Receiver<bool>>,
}

/// What a turn produced: an administrative reply or a completed backend turn.
#[derive(Debug)]
pub enum TurnReply {
    Command(String),
    Completed(TurnOutcome),
}

/// Per-conversation settings established by slash commands.
#[derive(Debug, Clone, Default)]
pub struct ConversationOverrides {
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
}

pub struct TurnCoordinator {
    registry: Arc<SessionRegistry>,
    overrides: std::sync::Mutex<HashMap<String, ConversationOverrides>>,
    /// Serializes the HTTP bridge path end-to-end so the fixed debug
    /// conversation behaves deterministically under rapid requests. The WS
    /// path relies on per-session busy rejection instead.
    http_lock: tokio::sync::Mutex<()>,
}

impl TurnCoordinator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            overrides: std::sync::Mutex::new(HashMap::new()),
            http_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn model_override(&self, conv_id: &str) -> Option<String> {
        self.overrides
            .lock()
            .unwrap()
            .get(conv_id)
            .and_then(|overrides| overrides.model.clone())
    }

    pub fn set_model_override(&self, conv_id: &str, model: Option<String>) {
        self.overrides
            .lock()
            .unwrap()
            .entry(conv_id.to_string())
            .or_default()
            .model = model;
    }

    pub fn cwd_override(&self, conv_id: &str) -> Option<PathBuf> {
        self.overrides
            .lock()
            .unwrap()
            .get(conv_id)
            .and_then(|overrides| overrides.cwd.clone())
    }

    pub fn set_cwd_override(&self, conv_id: &str, cwd: Option<PathBuf>) {
        self.overrides
            .lock()
            .unwrap()
            .entry(conv_id.to_string())
            .or_default()
            .cwd = cwd;
    }

    /// HTTP entry point: same as [`run_turn`], behind the bridge-wide mutex.
    pub async fn run_http_turn(&self, request: TurnRequest) -> Result<TurnReply, BridgeError> {
        let _guard = self.http_lock.lock().await;
        self.run_turn(request).await
    }

    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnReply, BridgeError> {
        let conv_id = request.conversation_id.clone();

        if let Some(reply) = commands::dispatch(self, &conv_id, &request.prompt).await {
            return Ok(TurnReply::Command(reply));
        }

        let model = self
            .model_override(&conv_id)
            .or_else(|| request.model.clone());
        let kind = self.registry.resolve_backend(model.as_deref());

        let existing = self.registry.get_session(&conv_id).await;
        let existing = match existing {
            Some(session) if session.kind() != kind => {
                tracing::info!(
                    conv = %conv_id,
                    from = %session.kind(),
                    to = %kind,
                    "backend kind changed; replacing session"
                );
                self.registry.destroy_session(&conv_id).await;
                None
            }
            Some(session) if !session.backend.is_alive() => {
                self.registry.destroy_session(&conv_id).await;
                None
            }
            other => other,
        };

        let session = match existing {
            Some(session) => {
                session.touch();
                session
            }
            None => {
                self.registry
                    .create_session(
                        &conv_id,
                        CreateOptions {
                            cwd: self.cwd_override(&conv_id),
                            model,
                            resume_id: None,
                            compact: false,
                        },
                    )
                    .await?
            }
        };

        let abort_watcher = spawn_abort_watcher(&session, request.cancel.clone());

        let mut result = session
            .backend
            .send_message(&request.prompt, request.sink.clone())
            .await;

        // One restart-and-retry for transient backend failures; never after
        // a cancellation.
        if let Err(err) = &result {
            let cancelled = err.is_aborted() || tripped(&request.cancel);
            if cancelled {
                if let Some(handle) = abort_watcher {
                    handle.abort();
                }
                return Err(BridgeError::Aborted);
            }
            tracing::error!(
                conv = %conv_id,
                error = %err,
                "turn failed; restarting backend and retrying once"
            );
            if let Err(restart_err) = session.backend.restart().await {
                if let Some(handle) = abort_watcher {
                    handle.abort();
                }
                return Err(restart_err);
            }
            result = session
                .backend
                .send_message(&request.prompt, request.sink.clone())
                .await;
        }

        if let Some(handle) = abort_watcher {
            handle.abort();
        }

        match result {
            Ok(outcome) => {
                session.touch();
                if let Some(session_id) = outcome
                    .session_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                {
                    self.registry.persist_after_turn(
                        &conv_id,
                        session_id.to_string(),
                        session.kind(),
                        session.backend.model(),
                        session.backend.cwd(),
                    );
                }
                Ok(TurnReply::Completed(outcome))
            }
            Err(err) if err.is_aborted() || tripped(&request.cancel) => Err(BridgeError::Aborted),
            Err(err) => Err(err),
        }
    }
}

fn tripped(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Bind the caller's cancellation signal to `abort_turn` for the duration of
/// one call. The returned handle is aborted when the turn resolves.
fn spawn_abort_watcher(
    session: &Arc<Session>,
    cancel: Option<watch::Receiver<bool>>,
) -> Option<tokio::task::JoinHandle<()>> {
    let mut rx = cancel?;
    let session = session.clone();
    Some(tokio::spawn(async move {
        loop {
            if *rx.borrow() {
                session.backend.abort_turn();
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::persistence::SessionFileStore;
    use std::time::Duration;

    fn test_coordinator() -> (Arc<TurnCoordinator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionFileStore::load(
            dir.path().join("bridge-sessions.json"),
        ));
        let config = BridgeConfig {
            ephemeral_models: vec!["m-e".to_string()],
            default_cwd: dir.path().to_path_buf(),
            codex_binary: dir.path().join("missing-codex"),
            ..BridgeConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new(config, store));
        (Arc::new(TurnCoordinator::new(registry)), dir)
    }

    #[tokio::test]
    async fn slash_commands_are_intercepted() {
        let (coordinator, _dir) = test_coordinator();
        let reply = coordinator
            .run_turn(TurnRequest {
                conversation_id: "debug".to_string(),
                prompt: "/help".to_string(),
                model: None,
                sink: None,
                cancel: None,
            })
            .await
            .unwrap();
        match reply {
            TurnReply::Command(text) => assert!(text.contains("/sessions")),
            TurnReply::Completed(_) => panic!("expected a command reply"),
        }
    }

    #[tokio::test]
    async fn model_override_beats_request_model() {
        let (coordinator, _dir) = test_coordinator();
        coordinator.set_model_override("C", Some("m-e".to_string()));
        assert_eq!(coordinator.model_override("C").as_deref(), Some("m-e"));
        assert_eq!(coordinator.model_override("other"), None);
    }

    #[tokio::test]
    async fn tripped_cancel_token_is_detected() {
        let (tx, rx) = watch::channel(false);
        assert!(!tripped(&Some(rx.clone())));
        tx.send(true).unwrap();
        assert!(tripped(&Some(rx)));
        assert!(!tripped(&None));
    }

    #[tokio::test]
    async fn cancelled_turn_is_silent_even_on_backend_error() {
        // codex binary that does not exist: send_message fails to spawn,
        // but a tripped token must suppress the retry and yield Aborted
        let (coordinator, _dir) = test_coordinator();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = coordinator
            .run_turn(TurnRequest {
                conversation_id: "C".to_string(),
                prompt: "hi".to_string(),
                model: Some("m-e".to_string()),
                sink: None,
                cancel: Some(rx),
            })
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
