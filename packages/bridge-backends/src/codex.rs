//! Ephemeral codex backend: no child between turns. Every message spawns a
//! fresh `codex exec` (or `codex exec resume <thread>`) and reads its JSONL
//! event stream to EOF.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use agent_bridge_error::BridgeError;

use crate::events::{CodexEvent, CodexUsage};
use crate::{truncate_tail, DeltaSink, TurnOutcome};

const STDERR_TAIL_LINES: usize = 20;
const ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CodexOptions {
    pub binary: PathBuf,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub resume_thread_id: Option<String>,
}

impl CodexOptions {
    pub fn new(binary: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cwd: cwd.into(),
            model: None,
            resume_thread_id: None,
        }
    }
}

#[derive(Default)]
struct Shared {
    thread_id: Mutex<Option<String>>,
    usage: Mutex<CodexUsage>,
    pid: AtomicU32,
    busy: AtomicBool,
    stopped: AtomicBool,
    aborted: AtomicBool,
}

pub struct CodexBackend {
    options: CodexOptions,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CodexBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodexBackend")
            .field("binary", &self.options.binary)
            .field("cwd", &self.options.cwd)
            .field("thread_id", &self.session_id())
            .finish()
    }
}

/// Per-spawn collection result, before the success/failure call is made.
struct Attempt {
    final_text: String,
    produced_text: bool,
    exit_code: Option<i32>,
    exit_ok: bool,
    error: Option<String>,
    stderr_tail: String,
}

impl CodexBackend {
    pub fn new(options: CodexOptions) -> Self {
        let shared = Arc::new(Shared::default());
        *shared.thread_id.lock().unwrap() = options.resume_thread_id.clone();
        Self { options, shared }
    }

    /// Nothing to spawn up front; the backend is usable immediately.
    pub fn start(&self) -> Result<(), BridgeError> {
        self.shared.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Marks the backend stopped and terminates any in-flight child.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let pid = self.shared.pid.load(Ordering::SeqCst);
        if pid != 0 {
            signal(pid, libc::SIGTERM);
        }
    }

    /// No persistent child to recycle; just clears the stopped flag.
    pub fn restart(&self) -> Result<(), BridgeError> {
        self.start()
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// SIGINT the current child; the reader loop ends at EOF and the pending
    /// turn fails with `Aborted`.
    pub fn abort_turn(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        let pid = self.shared.pid.load(Ordering::SeqCst);
        if pid != 0 {
            tracing::info!(pid = pid, "aborting in-flight codex turn");
            signal(pid, libc::SIGINT);
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.thread_id.lock().unwrap().clone()
    }

    pub fn cwd(&self) -> &Path {
        &self.options.cwd
    }

    pub fn model(&self) -> Option<&str> {
        self.options.model.as_deref()
    }

    pub fn usage(&self) -> CodexUsage {
        *self.shared.usage.lock().unwrap()
    }

    pub async fn send_message(
        &self,
        text: &str,
        sink: Option<DeltaSink>,
    ) -> Result<TurnOutcome, BridgeError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(BridgeError::NotRunning);
        }
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Busy);
        }
        self.shared.aborted.store(false, Ordering::SeqCst);

        let result = self.run_turn(text, sink.as_ref()).await;

        self.shared.pid.store(0, Ordering::SeqCst);
        self.shared.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn run_turn(
        &self,
        text: &str,
        sink: Option<&DeltaSink>,
    ) -> Result<TurnOutcome, BridgeError> {
        let resume = self.session_id();
        let mut attempt = self.run_attempt(text, sink, resume.as_deref()).await?;

        // A resumed thread that yields nothing is assumed gone on the codex
        // side: retry exactly once as a fresh thread.
        if resume.is_some()
            && !attempt.produced_text
            && !self.shared.aborted.load(Ordering::SeqCst)
        {
            tracing::warn!(
                thread = resume.as_deref().unwrap_or(""),
                "codex resume produced no output; retrying as a fresh thread"
            );
            *self.shared.thread_id.lock().unwrap() = None;
            attempt = self.run_attempt(text, sink, None).await?;
        }

        if self.shared.aborted.load(Ordering::SeqCst) {
            return Err(BridgeError::Aborted);
        }

        if attempt.produced_text || attempt.exit_ok {
            if let Some(error) = &attempt.error {
                tracing::error!(error = %error, "codex reported an error alongside output");
            }
            return Ok(TurnOutcome {
                final_text: attempt.final_text,
                session_id: self.session_id(),
            });
        }

        let message = attempt.error.unwrap_or_else(|| {
            format!(
                "failed (exit {}): {}",
                attempt
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                attempt.stderr_tail
            )
        });
        Err(BridgeError::TurnFailed {
            message: truncate_tail(&message, ERROR_MESSAGE_CHARS),
        })
    }

    async fn run_attempt(
        &self,
        text: &str,
        sink: Option<&DeltaSink>,
        resume: Option<&str>,
    ) -> Result<Attempt, BridgeError> {
        let args = build_codex_args(&self.options, resume, text);

        let mut command = Command::new(&self.options.binary);
        command
            .args(&args)
            .current_dir(&self.options.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| BridgeError::Spawn {
            command: self.options.binary.display().to_string(),
            source: err,
        })?;
        self.shared
            .pid
            .store(child.id().unwrap_or(0), Ordering::SeqCst);
        tracing::debug!(
            resume = resume.unwrap_or(""),
            "codex exec spawned"
        );

        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Internal {
            message: "failed to capture codex stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BridgeError::Internal {
            message: "failed to capture codex stderr".to_string(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_handle = {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = tail.lock().unwrap();
                    guard.push_back(line);
                    while guard.len() > STDERR_TAIL_LINES {
                        guard.pop_front();
                    }
                }
            })
        };

        let mut last_sent = 0usize;
        let mut final_text = String::new();
        let mut produced_text = false;
        let mut error: Option<String> = None;

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // malformed lines are skipped without noise
            let Ok(event) = serde_json::from_str::<CodexEvent>(trimmed) else {
                continue;
            };
            match event.kind.as_str() {
                "thread.started" => {
                    if let Some(thread) = event.thread_id {
                        *self.shared.thread_id.lock().unwrap() = Some(thread);
                    }
                }
                "item.started" | "item.updated" => {
                    if let Some(item) = &event.item {
                        if item.is_agent_message() {
                            if let Some(item_text) = item.text.as_deref() {
                                let delta = text_after(item_text, last_sent);
                                if !delta.is_empty() {
                                    if let Some(sink) = sink {
                                        sink(delta);
                                    }
                                }
                                last_sent = item_text.len();
                            }
                        }
                    }
                }
                "item.completed" => {
                    if let Some(item) = &event.item {
                        if item.is_agent_message() {
                            if let Some(item_text) = item.text.as_deref() {
                                let delta = text_after(item_text, last_sent);
                                if !delta.is_empty() {
                                    if let Some(sink) = sink {
                                        sink(delta);
                                    }
                                }
                                final_text = item_text.to_string();
                                produced_text |= !item_text.is_empty();
                            }
                            last_sent = 0;
                        }
                    }
                }
                "turn.completed" => {
                    if let Some(turn_usage) = event.usage {
                        let mut usage = self.shared.usage.lock().unwrap();
                        usage.input_tokens += turn_usage.input_tokens;
                        usage.output_tokens += turn_usage.output_tokens;
                    }
                }
                "turn.failed" | "error" => {
                    if let Some(message) = event.error_message() {
                        error = Some(message);
                    }
                }
                _ => {}
            }
        }

        let status = child.wait().await;
        let _ = stderr_handle.await;
        let exit_code = status.as_ref().ok().and_then(|status| status.code());
        let exit_ok = status.map(|status| status.success()).unwrap_or(false);

        let stderr_tail = {
            let tail = stderr_tail.lock().unwrap();
            tail.iter().cloned().collect::<Vec<_>>().join("\n")
        };

        Ok(Attempt {
            final_text,
            produced_text,
            exit_code,
            exit_ok,
            error,
            stderr_tail,
        })
    }
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

fn build_codex_args(options: &CodexOptions, resume: Option<&str>, prompt: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(thread) = resume {
        args.push("resume".to_string());
        args.push(thread.to_string());
    }
    args.push("--json".to_string());
    args.push("--skip-git-repo-check".to_string());
    args.push("--full-auto".to_string());
    if let Some(model) = options.model.as_deref() {
        if !model.is_empty() {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
    }
    args.push("--cd".to_string());
    args.push(options.cwd.display().to_string());
    args.push(prompt.to_string());
    args
}

/// Incremental slice of an item's text past what was already sent, snapped
/// back to a char boundary when the offset lands inside a code point.
fn text_after(text: &str, sent: usize) -> &str {
    if sent >= text.len() {
        return "";
    }
    let mut start = sent;
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_invocation_args() {
        let mut options = CodexOptions::new("/usr/bin/codex", "/work");
        options.model = Some("m-e".to_string());
        let args = build_codex_args(&options, None, "do the thing");
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "--json");
        let joined = args.join(" ");
        assert!(joined.contains("--skip-git-repo-check"));
        assert!(joined.contains("--full-auto"));
        assert!(joined.contains("--model m-e"));
        assert!(joined.contains("--cd /work"));
        assert_eq!(args.last().map(String::as_str), Some("do the thing"));
    }

    #[test]
    fn resume_invocation_args() {
        let options = CodexOptions::new("codex", "/work");
        let args = build_codex_args(&options, Some("T42"), "go");
        assert_eq!(&args[..3], &["exec", "resume", "T42"]);
        assert!(!args.join(" ").contains("--model"));
    }

    #[test]
    fn text_after_advances_from_sent_offset() {
        assert_eq!(text_after("hello", 0), "hello");
        assert_eq!(text_after("hello", 3), "lo");
        assert_eq!(text_after("hello", 5), "");
        assert_eq!(text_after("hi", 10), "");
    }

    #[test]
    fn text_after_respects_char_boundaries() {
        // "héllo": é is two bytes; offset 2 lands inside it
        let text = "h\u{e9}llo";
        let delta = text_after(text, 2);
        assert!(delta.starts_with('\u{e9}'));
    }

    #[test]
    fn backend_adopts_resume_thread() {
        let mut options = CodexOptions::new("codex", "/work");
        options.resume_thread_id = Some("T42".to_string());
        let backend = CodexBackend::new(options);
        assert_eq!(backend.session_id().as_deref(), Some("T42"));
    }

    #[tokio::test]
    async fn stopped_backend_rejects_messages() {
        let backend = CodexBackend::new(CodexOptions::new("codex", "/work"));
        backend.stop();
        let err = backend.send_message("hi", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning));
        assert!(!backend.is_alive());
    }
}
