//! Administrative slash commands.
//!
//! Recognized input returns a text reply; anything else returns `None` so
//! the caller forwards the message as a regular prompt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_bridge_backends::BackendKind;

use crate::config::CLAUDE_MODEL_ID;
use crate::coordinator::TurnCoordinator;
use crate::sessions::{CreateOptions, SessionRegistry};

/// Command names, exported to the bot channel as its skills manifest.
pub const SKILL_NAMES: &[&str] = &[
    "new", "sessions", "status", "help", "stop", "resume", "model", "cost", "compact",
];

pub async fn dispatch(
    coordinator: &TurnCoordinator,
    conv_id: &str,
    text: &str,
) -> Option<String> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed[1..].splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());
    let registry = coordinator.registry();

    let reply = match command.as_str() {
        "new" => cmd_new(coordinator, registry, conv_id, arg).await,
        "sessions" => cmd_sessions(registry).await,
        "status" => cmd_status(registry, conv_id).await,
        "help" => help_text(),
        "stop" => cmd_stop(registry, conv_id).await,
        "resume" => cmd_resume(registry, conv_id, arg).await,
        "model" => cmd_model(coordinator, registry, conv_id, arg).await,
        "cost" => cmd_cost(registry, conv_id).await,
        "compact" => cmd_compact(registry, conv_id).await,
        _ => return None,
    };
    tracing::info!(conv = conv_id, command = %command, "slash command handled");
    Some(reply)
}

async fn cmd_new(
    coordinator: &TurnCoordinator,
    registry: &Arc<SessionRegistry>,
    conv_id: &str,
    arg: Option<&str>,
) -> String {
    if let Some(path) = arg {
        let path = PathBuf::from(path);
        if !path.is_dir() {
            return format!("path does not exist: {}", path.display());
        }
        coordinator.set_cwd_override(conv_id, Some(path));
    }
    registry.store().clear(conv_id);
    registry.destroy_session(conv_id).await;
    let cwd = coordinator
        .cwd_override(conv_id)
        .unwrap_or_else(|| registry.config().default_cwd.clone());
    format!("Opened new session, cwd={}", cwd.display())
}

async fn cmd_sessions(registry: &Arc<SessionRegistry>) -> String {
    let rows = registry.list_sessions().await;
    if rows.is_empty() {
        return "no sessions".to_string();
    }
    let mut lines = Vec::with_capacity(rows.len());
    for row in rows {
        match row.conversation_id {
            Some(conv) => {
                let state = if !row.alive {
                    "dead"
                } else if row.busy {
                    "busy"
                } else {
                    "idle"
                };
                lines.push(format!(
                    "{conv}  {kind}  {id}  {state}  model={model}  idle={idle}  cost=${cost:.4}",
                    kind = row.kind,
                    id = short_id(row.session_id.as_deref()),
                    model = row.model.as_deref().unwrap_or("-"),
                    idle = format_idle(row.idle.unwrap_or_default()),
                    cost = row.cost,
                ));
            }
            None => {
                lines.push(format!(
                    "-  {kind}  {id}  dead  model={model}  cwd={cwd}",
                    kind = row.kind,
                    id = short_id(row.session_id.as_deref()),
                    model = row.model.as_deref().unwrap_or("-"),
                    cwd = row.cwd.display(),
                ));
            }
        }
    }
    lines.join("\n")
}

async fn cmd_status(registry: &Arc<SessionRegistry>, conv_id: &str) -> String {
    match registry.get_session(conv_id).await {
        Some(session) => format!(
            "backend={kind} alive={alive} busy={busy} cwd={cwd} session={id} model={model} cost=${cost:.4}",
            kind = session.kind(),
            alive = session.backend.is_alive(),
            busy = session.backend.is_busy(),
            cwd = session.backend.cwd().display(),
            id = short_id(session.backend.session_id().as_deref()),
            model = session.backend.model().unwrap_or("-"),
            cost = session.backend.total_cost(),
        ),
        None => "no active session".to_string(),
    }
}

async fn cmd_stop(registry: &Arc<SessionRegistry>, conv_id: &str) -> String {
    match registry.get_session(conv_id).await {
        Some(session) if session.backend.is_busy() => {
            session.backend.abort_turn();
            "aborted".to_string()
        }
        _ => "nothing to stop".to_string(),
    }
}

async fn cmd_resume(
    registry: &Arc<SessionRegistry>,
    conv_id: &str,
    arg: Option<&str>,
) -> String {
    let Some(prefix) = arg else {
        return "usage: /resume <session-id prefix>".to_string();
    };
    let Some(session_id) = registry.resolve_session_id_prefix(prefix).await else {
        return format!("no session matching '{prefix}'");
    };
    match registry.resume_session(conv_id, Some(session_id.clone())).await {
        Ok(_) => format!("resumed {session_id}"),
        Err(err) => format!("resume failed: {err}"),
    }
}

async fn cmd_model(
    coordinator: &TurnCoordinator,
    registry: &Arc<SessionRegistry>,
    conv_id: &str,
    arg: Option<&str>,
) -> String {
    match arg {
        Some(name) => {
            let new_kind = registry.resolve_backend(Some(name));
            let current_kind = match registry.get_session(conv_id).await {
                Some(session) => session.kind(),
                None => registry.resolve_backend(coordinator.model_override(conv_id).as_deref()),
            };
            coordinator.set_model_override(conv_id, Some(name.to_string()));
            if new_kind != current_kind {
                registry.store().clear(conv_id);
            }
            registry.destroy_session(conv_id).await;
            format!("model set to {name} ({new_kind}); next message starts a fresh session")
        }
        None => {
            let active = coordinator
                .model_override(conv_id)
                .unwrap_or_else(|| CLAUDE_MODEL_ID.to_string());
            let mut lines = vec!["available models:".to_string()];
            for (id, kind) in registry.config().known_models() {
                let marker = if id == active { "*" } else { " " };
                lines.push(format!("{marker} {id} ({kind})"));
            }
            lines.join("\n")
        }
    }
}

async fn cmd_cost(registry: &Arc<SessionRegistry>, conv_id: &str) -> String {
    match registry.get_session(conv_id).await {
        Some(session) if session.backend.total_cost() > 0.0 => {
            format!("total cost: ${:.4}", session.backend.total_cost())
        }
        _ => "no cost data".to_string(),
    }
}

async fn cmd_compact(registry: &Arc<SessionRegistry>, conv_id: &str) -> String {
    let Some(session) = registry.get_session(conv_id).await else {
        return "no active session to compact".to_string();
    };
    if session.kind() != BackendKind::Persistent {
        return "compact is only supported for the persistent backend".to_string();
    }
    let Some(session_id) = session.backend.session_id() else {
        return "no session id yet; nothing to compact".to_string();
    };
    let cwd = session.backend.cwd().to_path_buf();
    let model = session.backend.model().map(str::to_string);

    registry.destroy_session(conv_id).await;
    match registry
        .create_session(
            conv_id,
            CreateOptions {
                cwd: Some(cwd),
                model,
                resume_id: Some(session_id),
                compact: true,
            },
        )
        .await
    {
        Ok(_) => "compacted".to_string(),
        Err(err) => format!("compact failed: {err}"),
    }
}

fn help_text() -> String {
    [
        "/new [path]        start over (optionally in a new working directory)",
        "/sessions          list live and resumable sessions",
        "/status            current session details",
        "/stop              abort the in-flight turn",
        "/resume <prefix>   resume a session by id prefix",
        "/model [name]      switch models, or list them",
        "/cost              accumulated cost for this session",
        "/compact           restart the session with a compacted context",
        "/help              this text",
    ]
    .join("\n")
}

fn short_id(id: Option<&str>) -> String {
    match id {
        Some(id) if id.chars().count() > 8 => {
            let prefix: String = id.chars().take(8).collect();
            format!("{prefix}\u{2026}")
        }
        Some(id) if !id.is_empty() => id.to_string(),
        _ => "-".to_string(),
    }
}

fn format_idle(idle: Duration) -> String {
    let secs = idle.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}
