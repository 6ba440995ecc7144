//! Persistent claude backend: one long-running child per session, driven in
//! bidirectional stream-JSON mode over stdin/stdout.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use agent_bridge_error::BridgeError;

use crate::events::ClaudeEvent;
use crate::{truncate_tail, DeltaSink, TurnOutcome};

const STDERR_TAIL_LINES: usize = 20;
const STDERR_EXCERPT_CHARS: usize = 500;
const STOP_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ClaudeOptions {
    pub binary: PathBuf,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
    pub compact: bool,
    pub mcp_config: Option<PathBuf>,
    pub append_system_prompt: Option<String>,
    pub turn_timeout: Duration,
}

impl ClaudeOptions {
    pub fn new(binary: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cwd: cwd.into(),
            model: None,
            resume_session_id: None,
            compact: false,
            mcp_config: None,
            append_system_prompt: None,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        }
    }
}

struct ActiveTurn {
    buffer: String,
    sink: Option<DeltaSink>,
    done: oneshot::Sender<Result<TurnOutcome, BridgeError>>,
}

#[derive(Default)]
struct Shared {
    turn: Mutex<Option<ActiveTurn>>,
    session_id: Mutex<Option<String>>,
    total_cost: Mutex<f64>,
    stderr_tail: Mutex<VecDeque<String>>,
    alive: AtomicBool,
    pid: AtomicU32,
}

pub struct ClaudeBackend {
    options: ClaudeOptions,
    shared: Arc<Shared>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl std::fmt::Debug for ClaudeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeBackend")
            .field("binary", &self.options.binary)
            .field("cwd", &self.options.cwd)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ClaudeBackend {
    pub fn new(options: ClaudeOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared::default()),
            stdin: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the child and wire up the reader loops. No-op when already
    /// running. A restart resumes the last observed session id so the
    /// conversation survives the new process.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.is_alive() {
            return Ok(());
        }

        let resume = self
            .shared
            .session_id
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.options.resume_session_id.clone());
        let args = build_claude_args(&self.options, resume.as_deref());

        let mut command = Command::new(&self.options.binary);
        command
            .args(&args)
            .current_dir(&self.options.cwd)
            .env_remove("CLAUDECODE")
            .env("CI", "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", strip_local_bin_paths(&path.to_string_lossy()));
        }

        let mut child = command.spawn().map_err(|err| BridgeError::Spawn {
            command: self.options.binary.display().to_string(),
            source: err,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Internal {
            message: "failed to capture claude stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Internal {
            message: "failed to capture claude stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BridgeError::Internal {
            message: "failed to capture claude stderr".to_string(),
        })?;

        let pid = child.id().unwrap_or(0);
        self.shared.pid.store(pid, Ordering::SeqCst);
        self.shared.alive.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = Some(stdin);

        tracing::info!(
            pid = pid,
            binary = %self.options.binary.display(),
            cwd = %self.options.cwd.display(),
            resume = resume.as_deref().unwrap_or(""),
            "claude backend started"
        );

        spawn_stdout_loop(self.shared.clone(), stdout);
        spawn_stderr_loop(self.shared.clone(), stderr);
        spawn_exit_watcher(self.shared.clone(), child);
        Ok(())
    }

    /// Deliver one turn. Fails fast when the child is gone or a turn is
    /// already in flight. A turn timeout does not fail the turn: whatever
    /// prose accumulated is returned, because partial output is more useful
    /// than none.
    pub async fn send_message(
        &self,
        text: &str,
        sink: Option<DeltaSink>,
    ) -> Result<TurnOutcome, BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::NotRunning);
        }

        let rx = {
            let mut guard = self.shared.turn.lock().unwrap();
            if guard.is_some() {
                return Err(BridgeError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            *guard = Some(ActiveTurn {
                buffer: String::new(),
                sink,
                done: tx,
            });
            rx
        };

        let frame = json!({
            "type": "user",
            "message": { "role": "user", "content": text }
        });
        if let Err(err) = self.write_frame(&frame).await {
            self.shared.turn.lock().unwrap().take();
            return Err(err);
        }

        match tokio::time::timeout(self.options.turn_timeout, rx).await {
            Ok(Ok(result)) => result,
            // the sender was dropped without resolving; stop() was called
            Ok(Err(_)) => Err(BridgeError::NotRunning),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.options.turn_timeout.as_secs(),
                    "claude turn timed out; returning accumulated output"
                );
                let buffer = self
                    .shared
                    .turn
                    .lock()
                    .unwrap()
                    .take()
                    .map(|turn| turn.buffer)
                    .unwrap_or_default();
                Ok(TurnOutcome {
                    final_text: buffer,
                    session_id: self.session_id(),
                })
            }
        }
    }

    /// Drop the in-flight turn without killing the child. Trailing events
    /// from the child find no registered turn and are discarded.
    pub fn abort_turn(&self) {
        let turn = self.shared.turn.lock().unwrap().take();
        if let Some(turn) = turn {
            tracing::info!("aborting in-flight claude turn");
            let _ = turn.done.send(Err(BridgeError::Aborted));
        }
    }

    /// Idempotent. SIGTERM, wait up to 5 s for the exit watcher to observe
    /// the close, then SIGKILL.
    pub async fn stop(&self) {
        self.shared.turn.lock().unwrap().take();
        *self.stdin.lock().await = None;

        let pid = self.shared.pid.load(Ordering::SeqCst);
        if pid == 0 || !self.is_alive() {
            return;
        }

        signal(pid, libc::SIGTERM);
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::warn!(pid = pid, "claude did not exit after SIGTERM; killing");
        signal(pid, libc::SIGKILL);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn restart(&self) -> Result<(), BridgeError> {
        self.stop().await;
        self.start().await
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.turn.lock().unwrap().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().unwrap().clone()
    }

    pub fn cwd(&self) -> &Path {
        &self.options.cwd
    }

    pub fn model(&self) -> Option<&str> {
        self.options.model.as_deref()
    }

    pub fn total_cost(&self) -> f64 {
        *self.shared.total_cost.lock().unwrap()
    }

    async fn write_frame(&self, frame: &serde_json::Value) -> Result<(), BridgeError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(BridgeError::NotRunning)?;
        let mut bytes = serde_json::to_vec(frame).map_err(|err| BridgeError::Internal {
            message: format!("failed to serialize stdin frame: {err}"),
        })?;
        bytes.push(b'\n');
        stdin.write_all(&bytes).await.map_err(BridgeError::StdinWrite)?;
        stdin.flush().await.map_err(BridgeError::StdinWrite)?;
        Ok(())
    }
}

impl Shared {
    fn dispatch(&self, event: ClaudeEvent) {
        if let Some(rate_limit) = &event.rate_limit {
            if let Some(status) = rate_limit.status.as_deref() {
                if status != "allowed" {
                    tracing::warn!(status = status, "claude rate limit");
                }
            }
        }

        match event.kind.as_str() {
            "system" => {
                if event.subtype.as_deref() == Some("init") {
                    if let Some(id) = event.session_id {
                        *self.session_id.lock().unwrap() = Some(id);
                    }
                }
            }
            "stream_event" => {
                if let Some(text) = event.delta_text() {
                    let sink = {
                        let mut guard = self.turn.lock().unwrap();
                        match guard.as_mut() {
                            Some(turn) => {
                                turn.buffer.push_str(text);
                                turn.sink.clone()
                            }
                            // no turn registered (aborted); discard
                            None => None,
                        }
                    };
                    if let Some(sink) = sink {
                        sink(text);
                    }
                }
            }
            "result" => {
                if let Some(id) = event.session_id {
                    *self.session_id.lock().unwrap() = Some(id);
                }
                if let Some(cost) = event.total_cost_usd {
                    *self.total_cost.lock().unwrap() += cost;
                }
                let turn = self.turn.lock().unwrap().take();
                if let Some(turn) = turn {
                    let outcome = TurnOutcome {
                        final_text: turn.buffer,
                        session_id: self.session_id.lock().unwrap().clone(),
                    };
                    let _ = turn.done.send(Ok(outcome));
                }
            }
            // accumulated messages carry tool calls and results; not surfaced
            "assistant" | "user" => {}
            _ => {}
        }
    }

    fn stderr_excerpt(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap();
        let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        truncate_tail(&joined, STDERR_EXCERPT_CHARS)
    }
}

fn spawn_stdout_loop(shared: Arc<Shared>, stdout: ChildStdout) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ClaudeEvent>(trimmed) {
                Ok(event) => shared.dispatch(event),
                Err(err) => {
                    tracing::warn!(error = %err, "claude stdout: unparseable line");
                }
            }
        }
        tracing::debug!("claude stdout: stream ended");
    });
}

fn spawn_stderr_loop(shared: Arc<Shared>, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("claude stderr: {line}");
            let mut tail = shared.stderr_tail.lock().unwrap();
            tail.push_back(line);
            while tail.len() > STDERR_TAIL_LINES {
                tail.pop_front();
            }
        }
    });
}

fn spawn_exit_watcher(shared: Arc<Shared>, mut child: tokio::process::Child) {
    tokio::spawn(async move {
        let status = child.wait().await;
        shared.alive.store(false, Ordering::SeqCst);
        shared.pid.store(0, Ordering::SeqCst);
        let code = status.ok().and_then(|status| status.code());

        let turn = shared.turn.lock().unwrap().take();
        if let Some(turn) = turn {
            let stderr_tail = shared.stderr_excerpt();
            tracing::error!(code = ?code, "claude exited during a turn");
            let _ = turn.done.send(Err(BridgeError::ChildExited { code, stderr_tail }));
        } else {
            tracing::info!(code = ?code, "claude backend exited");
        }
    });
}

fn signal(pid: u32, sig: libc::c_int) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, sig);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, sig);
    }
}

fn build_claude_args(options: &ClaudeOptions, resume: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];
    if let Some(model) = options.model.as_deref() {
        if !model.is_empty() {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
    }
    if let Some(id) = resume {
        args.push("--resume".to_string());
        args.push(id.to_string());
    }
    if options.compact {
        args.push("--compact".to_string());
    }
    if let Some(path) = &options.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(path.display().to_string());
    }
    if let Some(prompt) = &options.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    args
}

/// Drop `node_modules/.bin` segments so the globally installed CLI wins over
/// any project-local shim.
fn strip_local_bin_paths(path: &str) -> String {
    let kept: Vec<_> = std::env::split_paths(path)
        .filter(|entry| !entry.to_string_lossy().contains("node_modules/.bin"))
        .collect();
    std::env::join_paths(kept)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}
