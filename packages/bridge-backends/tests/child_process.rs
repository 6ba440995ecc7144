//! End-to-end backend tests against fake agent CLIs written as shell
//! scripts. Unix-only: the scripts rely on /usr/bin/env sh and signals.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_bridge_backends::{
    ClaudeBackend, ClaudeOptions, CodexBackend, CodexOptions, DeltaSink,
};
use agent_bridge_error::BridgeError;
use tempfile::TempDir;

fn write_exec(path: &Path, script: &str) {
    std::fs::write(path, script).expect("write script");
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

fn collecting_sink() -> (DeltaSink, Arc<Mutex<Vec<String>>>) {
    let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_chunks = chunks.clone();
    let sink: DeltaSink = Arc::new(move |delta: &str| {
        sink_chunks.lock().unwrap().push(delta.to_string());
    });
    (sink, chunks)
}

fn fake_claude(dir: &TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("claude");
    write_exec(&path, script);
    path
}

fn fake_codex(dir: &TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("codex");
    write_exec(&path, script);
    path
}

const CLAUDE_ECHO: &str = r#"#!/usr/bin/env sh
echo '{"type":"system","subtype":"init","session_id":"S1"}'
while read -r line; do
  echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"he"}}}'
  echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"llo"}}}'
  echo '{"type":"result","result":"hello","session_id":"S1","total_cost_usd":0.01}'
done
"#;

const CLAUDE_SLOW: &str = r#"#!/usr/bin/env sh
echo '{"type":"system","subtype":"init","session_id":"S2"}'
while read -r line; do
  echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"partial"}}}'
  sleep 5
done
"#;

const CLAUDE_CRASH: &str = r#"#!/usr/bin/env sh
echo '{"type":"system","subtype":"init","session_id":"S3"}'
read -r line
echo "boom: backend fell over" >&2
sleep 1
exit 3
"#;

#[tokio::test]
async fn claude_turn_streams_deltas_and_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_claude(&dir, CLAUDE_ECHO);
    let backend = ClaudeBackend::new(ClaudeOptions::new(binary, dir.path()));
    backend.start().await.unwrap();

    let (sink, chunks) = collecting_sink();
    let outcome = backend.send_message("hi", Some(sink)).await.unwrap();

    assert_eq!(outcome.final_text, "hello");
    assert_eq!(outcome.session_id.as_deref(), Some("S1"));
    assert_eq!(*chunks.lock().unwrap(), vec!["he", "llo"]);
    assert_eq!(backend.session_id().as_deref(), Some("S1"));
    assert!(backend.total_cost() > 0.0);
    assert!(!backend.is_busy());

    backend.stop().await;
    assert!(!backend.is_alive());
}

#[tokio::test]
async fn claude_deltas_prefix_final_text() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_claude(&dir, CLAUDE_ECHO);
    let backend = ClaudeBackend::new(ClaudeOptions::new(binary, dir.path()));
    backend.start().await.unwrap();

    let (sink, chunks) = collecting_sink();
    let outcome = backend.send_message("hi", Some(sink)).await.unwrap();
    let streamed: String = chunks.lock().unwrap().concat();
    assert!(outcome.final_text.starts_with(&streamed));

    backend.stop().await;
}

#[tokio::test]
async fn claude_timeout_returns_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_claude(&dir, CLAUDE_SLOW);
    let mut options = ClaudeOptions::new(binary, dir.path());
    options.turn_timeout = Duration::from_millis(500);
    let backend = ClaudeBackend::new(options);
    backend.start().await.unwrap();

    let outcome = backend.send_message("hi", None).await.unwrap();
    assert_eq!(outcome.final_text, "partial");
    assert!(!backend.is_busy());
    assert!(backend.is_alive());

    backend.stop().await;
}

#[tokio::test]
async fn claude_child_exit_fails_turn_with_stderr_tail() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_claude(&dir, CLAUDE_CRASH);
    let backend = ClaudeBackend::new(ClaudeOptions::new(binary, dir.path()));
    backend.start().await.unwrap();

    let err = backend.send_message("hi", None).await.unwrap_err();
    match err {
        BridgeError::ChildExited { code, stderr_tail } => {
            assert_eq!(code, Some(3));
            assert!(stderr_tail.contains("boom"), "tail: {stderr_tail}");
        }
        other => panic!("expected ChildExited, got {other:?}"),
    }
    assert!(!backend.is_alive());
}

#[tokio::test]
async fn claude_rejects_second_turn_while_busy_and_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_claude(&dir, CLAUDE_SLOW);
    let backend = Arc::new(ClaudeBackend::new(ClaudeOptions::new(binary, dir.path())));
    backend.start().await.unwrap();

    let running = backend.clone();
    let first = tokio::spawn(async move { running.send_message("hi", None).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(backend.is_busy());
    let err = backend.send_message("again", None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Busy));

    backend.abort_turn();
    let result = first.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Aborted)));
    assert!(backend.is_alive());
    assert!(!backend.is_busy());

    backend.stop().await;
}

const CODEX_OK: &str = r#"#!/usr/bin/env sh
if [ "$2" = "resume" ]; then
  exit 0
fi
echo '{"type":"thread.started","thread_id":"T43"}'
echo '{"type":"item.started","item":{"type":"agent_message","id":"item_0","text":"he"}}'
echo '{"type":"item.updated","item":{"type":"agent_message","id":"item_0","text":"hello"}}'
echo '{"type":"item.completed","item":{"type":"agent_message","id":"item_0","text":"hello!"}}'
echo '{"type":"turn.completed","usage":{"input_tokens":3,"output_tokens":5}}'
exit 0
"#;

const CODEX_FAILED_TURN: &str = r#"#!/usr/bin/env sh
echo '{"type":"thread.started","thread_id":"T9"}'
echo '{"type":"turn.failed","error":{"message":"model overloaded"}}'
exit 1
"#;

const CODEX_SILENT_FAILURE: &str = r#"#!/usr/bin/env sh
echo "auth required" >&2
exit 7
"#;

#[tokio::test]
async fn codex_turn_streams_incremental_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_codex(&dir, CODEX_OK);
    let backend = CodexBackend::new(CodexOptions::new(binary, dir.path()));

    let (sink, chunks) = collecting_sink();
    let outcome = backend.send_message("go", Some(sink)).await.unwrap();

    assert_eq!(outcome.final_text, "hello!");
    assert_eq!(outcome.session_id.as_deref(), Some("T43"));
    assert_eq!(*chunks.lock().unwrap(), vec!["he", "llo", "!"]);
    assert_eq!(backend.usage().output_tokens, 5);
    assert!(!backend.is_busy());
}

#[tokio::test]
async fn codex_empty_resume_retries_fresh_once() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_codex(&dir, CODEX_OK);
    let mut options = CodexOptions::new(binary, dir.path());
    options.resume_thread_id = Some("T42".to_string());
    let backend = CodexBackend::new(options);

    let outcome = backend.send_message("go", None).await.unwrap();
    assert_eq!(outcome.final_text, "hello!");
    // the stale thread id was discarded for the fresh invocation's id
    assert_eq!(outcome.session_id.as_deref(), Some("T43"));
    assert_eq!(backend.session_id().as_deref(), Some("T43"));
}

#[tokio::test]
async fn codex_turn_failure_surfaces_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_codex(&dir, CODEX_FAILED_TURN);
    let backend = CodexBackend::new(CodexOptions::new(binary, dir.path()));

    let err = backend.send_message("go", None).await.unwrap_err();
    match err {
        BridgeError::TurnFailed { message } => assert_eq!(message, "model overloaded"),
        other => panic!("expected TurnFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn codex_silent_failure_synthesizes_exit_message() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_codex(&dir, CODEX_SILENT_FAILURE);
    let backend = CodexBackend::new(CodexOptions::new(binary, dir.path()));

    let err = backend.send_message("go", None).await.unwrap_err();
    match err {
        BridgeError::TurnFailed { message } => {
            assert!(message.starts_with("failed (exit 7):"), "message: {message}");
            assert!(message.contains("auth required"));
        }
        other => panic!("expected TurnFailed, got {other:?}"),
    }
}
