//! Session registry: one live agent binding per conversation, with soft
//! capacity, idle retirement, and dead-session records kept for resume.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_bridge_backends::{
    AgentBackend, BackendKind, ClaudeBackend, ClaudeOptions, CodexBackend, CodexOptions,
};
use agent_bridge_error::BridgeError;

use crate::config::BridgeConfig;
use crate::persistence::SessionFileStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Session {
    pub conversation_id: String,
    pub backend: AgentBackend,
    last_activity: std::sync::Mutex<Instant>,
}

impl Session {
    fn new(conversation_id: String, backend: AgentBackend) -> Self {
        Self {
            conversation_id,
            backend,
            last_activity: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn touch(&self) {
        let mut guard = self.last_activity.lock().unwrap();
        *guard = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }
}

/// Identity retained after a session stops, enough to re-spawn with resume.
#[derive(Debug, Clone)]
pub struct DeadSession {
    pub session_id: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub resume_id: Option<String>,
    pub compact: bool,
}

/// One row of `list_sessions`: a live session or a dead record.
#[derive(Debug, Clone)]
pub struct SessionListing {
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub kind: BackendKind,
    pub alive: bool,
    pub busy: bool,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub idle: Option<Duration>,
    pub cost: f64,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<Session>>,
    dead: HashMap<String, DeadSession>,
}

pub struct SessionRegistry {
    config: BridgeConfig,
    store: Arc<SessionFileStore>,
    inner: tokio::sync::Mutex<RegistryState>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig, store: Arc<SessionFileStore>) -> Self {
        Self {
            config,
            store,
            inner: tokio::sync::Mutex::new(RegistryState::default()),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionFileStore> {
        &self.store
    }

    pub fn resolve_backend(&self, model: Option<&str>) -> BackendKind {
        self.config.resolve_backend(model)
    }

    /// Create (or replace) the session for a conversation. Over capacity,
    /// the oldest non-busy session is retired first; when everything is busy
    /// the ceiling is exceeded rather than refusing the conversation.
    pub async fn create_session(
        &self,
        conv_id: &str,
        options: CreateOptions,
    ) -> Result<Arc<Session>, BridgeError> {
        let mut state = self.inner.lock().await;

        if let Some(existing) = retire(&mut state, conv_id) {
            stop_in_background(existing);
        }

        if state.sessions.len() >= self.config.max_sessions {
            self.evict_oldest_idle(&mut state);
        }

        let kind = self.resolve_backend(options.model.as_deref());
        let mut cwd = options.cwd;
        let mut resume_id = options.resume_id;
        if resume_id.is_none() {
            if let Some(entry) = self.store.get(conv_id) {
                if entry.backend == kind {
                    resume_id = Some(entry.session_id);
                    if cwd.is_none() && !entry.cwd.is_empty() {
                        cwd = Some(PathBuf::from(entry.cwd));
                    }
                } else {
                    tracing::debug!(
                        conv = conv_id,
                        persisted = %entry.backend,
                        resolved = %kind,
                        "persisted entry ignored: backend kind changed"
                    );
                }
            }
        }
        let cwd = cwd.unwrap_or_else(|| self.config.default_cwd.clone());

        let backend = match kind {
            BackendKind::Persistent => {
                let mut claude = ClaudeOptions::new(&self.config.claude_binary, &cwd);
                claude.model = options.model.clone();
                claude.resume_session_id = resume_id.clone();
                claude.compact = options.compact;
                claude.mcp_config = self.config.mcp_config.clone();
                claude.append_system_prompt = self.config.append_system_prompt.clone();
                claude.turn_timeout = self.config.turn_timeout;
                AgentBackend::Claude(ClaudeBackend::new(claude))
            }
            BackendKind::Ephemeral => {
                let mut codex = CodexOptions::new(&self.config.codex_binary, &cwd);
                codex.model = options.model.clone();
                codex.resume_thread_id = resume_id.clone();
                AgentBackend::Codex(CodexBackend::new(codex))
            }
        };

        backend.start().await?;

        let session = Arc::new(Session::new(conv_id.to_string(), backend));
        state.sessions.insert(conv_id.to_string(), session.clone());
        tracing::info!(
            conv = conv_id,
            kind = %kind,
            cwd = %cwd.display(),
            resume = resume_id.as_deref().unwrap_or(""),
            "session created"
        );
        Ok(session)
    }

    pub async fn get_session(&self, conv_id: &str) -> Option<Arc<Session>> {
        self.inner.lock().await.sessions.get(conv_id).cloned()
    }

    /// Live sessions first, then dead records whose id is not live.
    pub async fn list_sessions(&self) -> Vec<SessionListing> {
        let state = self.inner.lock().await;
        let mut live_ids = Vec::new();
        let mut rows = Vec::new();

        for session in state.sessions.values() {
            let session_id = session.backend.session_id();
            if let Some(id) = &session_id {
                live_ids.push(id.clone());
            }
            rows.push(SessionListing {
                conversation_id: Some(session.conversation_id.clone()),
                session_id,
                kind: session.kind(),
                alive: session.backend.is_alive(),
                busy: session.backend.is_busy(),
                cwd: session.backend.cwd().to_path_buf(),
                model: session.backend.model().map(str::to_string),
                idle: Some(session.idle_for()),
                cost: session.backend.total_cost(),
            });
        }

        for dead in state.dead.values() {
            if live_ids.iter().any(|id| id == &dead.session_id) {
                continue;
            }
            rows.push(SessionListing {
                conversation_id: None,
                session_id: Some(dead.session_id.clone()),
                kind: dead.kind,
                alive: false,
                busy: false,
                cwd: dead.cwd.clone(),
                model: dead.model.clone(),
                idle: None,
                cost: 0.0,
            });
        }
        rows
    }

    pub async fn dead_session(&self, session_id: &str) -> Option<DeadSession> {
        self.inner.lock().await.dead.get(session_id).cloned()
    }

    /// Resolve a session-id prefix against live sessions and dead records.
    pub async fn resolve_session_id_prefix(&self, prefix: &str) -> Option<String> {
        let state = self.inner.lock().await;
        for session in state.sessions.values() {
            if let Some(id) = session.backend.session_id() {
                if id.starts_with(prefix) {
                    return Some(id);
                }
            }
        }
        state
            .dead
            .keys()
            .find(|id| id.starts_with(prefix))
            .cloned()
    }

    pub async fn destroy_session(&self, conv_id: &str) {
        let session = {
            let mut state = self.inner.lock().await;
            retire(&mut state, conv_id)
        };
        if let Some(session) = session {
            tracing::info!(conv = conv_id, "session destroyed");
            session.backend.stop().await;
        }
    }

    /// Re-create a conversation's session from a (possibly dead) session id.
    pub async fn resume_session(
        &self,
        conv_id: &str,
        session_id: Option<String>,
    ) -> Result<Arc<Session>, BridgeError> {
        let current = self.get_session(conv_id).await;
        let target = match session_id.or_else(|| {
            current
                .as_ref()
                .and_then(|session| session.backend.session_id())
        }) {
            Some(id) => id,
            None => {
                return Err(BridgeError::InvalidRequest {
                    message: "no session id to resume".to_string(),
                })
            }
        };

        let (cwd, model) = match self.dead_session(&target).await {
            Some(dead) => (Some(dead.cwd), dead.model),
            None => match &current {
                Some(session) => (
                    Some(session.backend.cwd().to_path_buf()),
                    session.backend.model().map(str::to_string),
                ),
                None => (None, None),
            },
        };

        self.destroy_session(conv_id).await;
        self.create_session(
            conv_id,
            CreateOptions {
                cwd,
                model,
                resume_id: Some(target),
                compact: false,
            },
        )
        .await
    }

    pub fn persist_after_turn(
        &self,
        conv_id: &str,
        session_id: String,
        kind: BackendKind,
        model: Option<&str>,
        cwd: &std::path::Path,
    ) {
        self.store.persist(
            conv_id,
            session_id,
            kind,
            model.unwrap_or_default().to_string(),
            cwd.display().to_string(),
        );
    }

    /// Start the 60-second idle sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep_once().await;
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Retire every non-busy session idle past the configured timeout.
    pub async fn sweep_once(&self) {
        let expired = {
            let mut state = self.inner.lock().await;
            let cutoff = self.config.idle_timeout;
            let conv_ids: Vec<String> = state
                .sessions
                .values()
                .filter(|session| {
                    !session.backend.is_busy() && session.last_activity().elapsed() > cutoff
                })
                .map(|session| session.conversation_id.clone())
                .collect();
            conv_ids
                .iter()
                .filter_map(|conv_id| retire(&mut state, conv_id))
                .collect::<Vec<_>>()
        };
        for session in expired {
            tracing::info!(
                conv = %session.conversation_id,
                idle_secs = session.idle_for().as_secs(),
                "idle session retired"
            );
            stop_in_background(session);
        }
    }

    /// Cancel the sweeper, flush persistence, and stop every session.
    pub async fn stop_all(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.store.flush();
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.inner.lock().await;
            state.dead.clear();
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.backend.stop().await;
        }
    }

    fn evict_oldest_idle(&self, state: &mut RegistryState) {
        let victim = state
            .sessions
            .values()
            .filter(|session| !session.backend.is_busy())
            .min_by_key(|session| session.last_activity())
            .map(|session| session.conversation_id.clone());
        match victim {
            Some(conv_id) => {
                if let Some(session) = retire(state, &conv_id) {
                    tracing::info!(conv = %conv_id, "evicted oldest idle session");
                    stop_in_background(session);
                }
            }
            None => {
                tracing::warn!(
                    max_sessions = self.config.max_sessions,
                    "all sessions busy; exceeding the session ceiling"
                );
            }
        }
    }
}

/// Remove a conversation's session from the live map, capturing its identity
/// as a dead record when it has one. The caller owns stopping the backend.
fn retire(state: &mut RegistryState, conv_id: &str) -> Option<Arc<Session>> {
    let session = state.sessions.remove(conv_id)?;
    if let Some(session_id) = session.backend.session_id() {
        if !session_id.is_empty() {
            state.dead.insert(
                session_id.clone(),
                DeadSession {
                    session_id,
                    cwd: session.backend.cwd().to_path_buf(),
                    model: session.backend.model().map(str::to_string),
                    kind: session.kind(),
                },
            );
        }
    }
    Some(session)
}

fn stop_in_background(session: Arc<Session>) {
    tokio::spawn(async move {
        session.backend.stop().await;
    });
}
