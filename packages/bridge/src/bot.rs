//! Outbound WebSocket bot channel.
//!
//! Connects to the Arinova chat server, registers the slash commands as
//! skills, and maps task events one-to-one onto the coordinator. The whole
//! adapter is absent when no bot token is configured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use agent_bridge_backends::DeltaSink;

use crate::commands::SKILL_NAMES;
use crate::coordinator::{TurnCoordinator, TurnReply, TurnRequest};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub server_url: String,
    pub token: String,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BotEvent {
    Task {
        id: String,
        conversation_id: String,
        content: String,
        #[serde(default)]
        model: Option<String>,
    },
    Cancel {
        id: String,
    },
    #[serde(other)]
    Unknown,
}

type ActiveTasks = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

/// Connect, serve tasks, and reconnect forever on unexpected disconnects.
pub async fn run_bot(config: BotConfig, coordinator: Arc<TurnCoordinator>) {
    loop {
        match run_connection(&config, &coordinator).await {
            Ok(()) => tracing::info!("bot connection closed by server"),
            Err(err) => tracing::warn!(error = %err, "bot connection failed"),
        }
        tokio::time::sleep(config.reconnect_delay).await;
        tracing::info!(url = %config.server_url, "reconnecting bot");
    }
}

async fn run_connection(
    config: &BotConfig,
    coordinator: &Arc<TurnCoordinator>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let url = format!("{}?token={}", config.server_url, config.token);
    let (stream, _response) = connect_async(url.as_str()).await?;
    tracing::info!(url = %config.server_url, "bot connected");
    let (mut sink, mut source) = stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let _ = out_tx.send(register_frame());

    let active: ActiveTasks = Arc::new(Mutex::new(HashMap::new()));
    while let Some(message) = source.next().await {
        let message = message?;
        let Some(event) = parse_event(message) else {
            continue;
        };
        match event {
            BotEvent::Task {
                id,
                conversation_id,
                content,
                model,
            } => {
                let coordinator = coordinator.clone();
                let out_tx = out_tx.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    handle_task(coordinator, out_tx, active, id, conversation_id, content, model)
                        .await;
                });
            }
            BotEvent::Cancel { id } => {
                if let Some(sender) = active.lock().unwrap().get(&id) {
                    tracing::info!(task = %id, "cancel requested");
                    let _ = sender.send(true);
                }
            }
            BotEvent::Unknown => {}
        }
    }

    writer.abort();
    Ok(())
}

async fn handle_task(
    coordinator: Arc<TurnCoordinator>,
    out_tx: mpsc::UnboundedSender<String>,
    active: ActiveTasks,
    task_id: String,
    conversation_id: String,
    content: String,
    model: Option<String>,
) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    active.lock().unwrap().insert(task_id.clone(), cancel_tx);

    let sink: DeltaSink = {
        let out_tx = out_tx.clone();
        let task_id = task_id.clone();
        Arc::new(move |delta: &str| {
            let frame = json!({ "type": "chunk", "id": task_id, "content": delta });
            let _ = out_tx.send(frame.to_string());
        })
    };

    let result = coordinator
        .run_turn(TurnRequest {
            conversation_id,
            prompt: content,
            model,
            sink: Some(sink),
            cancel: Some(cancel_rx),
        })
        .await;

    active.lock().unwrap().remove(&task_id);

    match result {
        Ok(reply) => {
            let text = match reply {
                TurnReply::Command(text) => text,
                TurnReply::Completed(outcome) => outcome.final_text,
            };
            let frame = json!({ "type": "complete", "id": task_id, "content": text });
            let _ = out_tx.send(frame.to_string());
        }
        Err(err) if err.is_aborted() => {
            tracing::debug!(task = %task_id, "task cancelled");
        }
        Err(err) => {
            let frame = json!({ "type": "error", "id": task_id, "message": err.to_string() });
            let _ = out_tx.send(frame.to_string());
        }
    }
}

fn register_frame() -> String {
    json!({ "type": "register", "skills": SKILL_NAMES }).to_string()
}

fn parse_event(message: WsMessage) -> Option<BotEvent> {
    let text = match message {
        WsMessage::Text(text) => text,
        WsMessage::Binary(bytes) => String::from_utf8(bytes).ok()?,
        // pings and pongs are handled by the transport; close ends the loop
        _ => return None,
    };
    match serde_json::from_str::<BotEvent>(&text) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::debug!(error = %err, "unrecognized bot frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_carries_all_skills() {
        let frame: serde_json::Value = serde_json::from_str(&register_frame()).unwrap();
        assert_eq!(frame["type"], "register");
        let skills = frame["skills"].as_array().unwrap();
        assert_eq!(skills.len(), SKILL_NAMES.len());
        assert!(skills.iter().any(|skill| skill == "resume"));
    }

    #[test]
    fn parse_task_event() {
        let message = WsMessage::Text(
            r#"{"type":"task","id":"t1","conversation_id":"C","content":"go"}"#.to_string(),
        );
        match parse_event(message) {
            Some(BotEvent::Task {
                id,
                conversation_id,
                content,
                model,
            }) => {
                assert_eq!(id, "t1");
                assert_eq!(conversation_id, "C");
                assert_eq!(content, "go");
                assert_eq!(model, None);
            }
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[test]
    fn parse_cancel_event() {
        let message =
            WsMessage::Text(r#"{"type":"cancel","id":"t1"}"#.to_string());
        assert!(matches!(parse_event(message), Some(BotEvent::Cancel { .. })));
    }

    #[test]
    fn transport_frames_are_ignored() {
        assert!(parse_event(WsMessage::Ping(Vec::new())).is_none());
        assert!(parse_event(WsMessage::Pong(Vec::new())).is_none());
        assert!(parse_event(WsMessage::Close(None)).is_none());
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let message = WsMessage::Text(r#"{"type":"presence","user":"x"}"#.to_string());
        assert!(matches!(parse_event(message), Some(BotEvent::Unknown)));
    }
}
