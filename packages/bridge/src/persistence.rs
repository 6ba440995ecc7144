//! Durable per-conversation session identity, so conversations resume
//! transparently across gateway restarts.
//!
//! Persistence is an optimization, never a correctness requirement: every
//! disk failure is logged and swallowed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use agent_bridge_backends::BackendKind;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// The most recent successful turn's identity for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntry {
    pub session_id: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub model: String,
    pub cwd: String,
    pub updated_at: String,
}

#[derive(Debug)]
pub struct SessionFileStore {
    path: PathBuf,
    entries: Arc<Mutex<HashMap<String, PersistedEntry>>>,
    debounce: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionFileStore {
    /// Best-effort load. A missing file yields an empty store; corrupt JSON
    /// logs a warning and starts empty; malformed entries are dropped.
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => {
                    let mut entries = HashMap::new();
                    for (conv_id, value) in map {
                        match serde_json::from_value::<PersistedEntry>(value) {
                            Ok(entry) if !entry.session_id.is_empty() => {
                                entries.insert(conv_id, entry);
                            }
                            Ok(_) => {
                                tracing::debug!(conv = %conv_id, "dropping entry with empty session id");
                            }
                            Err(err) => {
                                tracing::debug!(conv = %conv_id, error = %err, "dropping malformed entry");
                            }
                        }
                    }
                    entries
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "session file is corrupt; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        if !entries.is_empty() {
            tracing::info!(
                path = %path.display(),
                conversations = entries.len(),
                "loaded persisted sessions"
            );
        }

        Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
            debounce: Mutex::new(None),
        }
    }

    pub fn get(&self, conv_id: &str) -> Option<PersistedEntry> {
        self.entries.lock().unwrap().get(conv_id).cloned()
    }

    pub fn persist(
        &self,
        conv_id: &str,
        session_id: String,
        backend: BackendKind,
        model: String,
        cwd: String,
    ) {
        let entry = PersistedEntry {
            session_id,
            backend,
            model,
            cwd,
            updated_at: now_rfc3339(),
        };
        self.entries
            .lock()
            .unwrap()
            .insert(conv_id.to_string(), entry);
        self.arm_debounce();
    }

    /// Remove a conversation's entry; only a real removal arms the writer.
    pub fn clear(&self, conv_id: &str) {
        let removed = self.entries.lock().unwrap().remove(conv_id).is_some();
        if removed {
            self.arm_debounce();
        }
    }

    /// Cancel any pending debounced write and write synchronously.
    pub fn flush(&self) {
        if let Some(handle) = self.debounce.lock().unwrap().take() {
            handle.abort();
        }
        let snapshot = self.entries.lock().unwrap().clone();
        write_to_disk(&self.path, &snapshot);
    }

    fn arm_debounce(&self) {
        let mut guard = self.debounce.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let path = self.path.clone();
        let entries = self.entries.clone();
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let snapshot = entries.lock().unwrap().clone();
            write_to_disk(&path, &snapshot);
        }));
    }
}

fn write_to_disk(path: &Path, snapshot: &HashMap<String, PersistedEntry>) {
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::error!(error = %err, "failed to create state directory");
            return;
        }
    }
    let mut content = match serde_json::to_string_pretty(snapshot) {
        Ok(content) => content,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize session file");
            return;
        }
    };
    content.push('\n');
    if let Err(err) = std::fs::write(path, content) {
        tracing::error!(path = %path.display(), error = %err, "failed to write session file");
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
