//! OpenAI-compatible HTTP surface.
//!
//! `POST /v1/chat/completions` joins the same session ecosystem as the WS
//! bot under a fixed conversation id, so the HTTP path can be used to debug
//! the very sessions the bot drives.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;

use agent_bridge_backends::DeltaSink;
use agent_bridge_error::{openai_error_body, BridgeError, ErrorType};

use crate::config::CLAUDE_MODEL_ID;
use crate::coordinator::{TurnCoordinator, TurnReply, TurnRequest};
use crate::openai::{
    completion_payload, content_chunk, extract_prompt, final_chunk, models_payload, model_entry,
    ChatCompletionsRequest,
};

/// The HTTP bridge pins every request to one conversation.
pub const HTTP_CONVERSATION_ID: &str = "debug";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

static RESPONSE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct AppState {
    coordinator: Arc<TurnCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<TurnCoordinator>) -> Self {
        Self { coordinator }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:id", get(get_model))
        .fallback(not_found)
        .with_state(state);

    let http_logging = match std::env::var("BRIDGE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_response(|res: &Response, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

async fn get_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ids: Vec<String> = state
        .coordinator
        .registry()
        .config()
        .known_models()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    Json(models_payload(&ids))
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let known = state
        .coordinator
        .registry()
        .config()
        .known_models()
        .into_iter()
        .any(|(model_id, _)| model_id == id);
    if known {
        Json(model_entry(&id)).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("model '{id}' not found"),
            ErrorType::InvalidRequest,
        )
    }
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found", ErrorType::InvalidRequest)
}

fn error_response(status: StatusCode, message: &str, error_type: ErrorType) -> Response {
    (status, Json(openai_error_body(message, error_type))).into_response()
}

fn bridge_error_response(err: &BridgeError) -> Response {
    let status = StatusCode::from_u16(err.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_openai_body())).into_response()
}

fn next_response_id() -> String {
    let id = RESPONSE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("chatcmpl-bridge-{id}")
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {err}"),
                ErrorType::InvalidRequest,
            )
        }
    };

    let prompt = match extract_prompt(&request.messages) {
        Ok(prompt) => prompt,
        Err(err) => return bridge_error_response(&err),
    };

    let model = request.model.clone();
    let display_model = model
        .clone()
        .unwrap_or_else(|| CLAUDE_MODEL_ID.to_string());

    if request.wants_stream() {
        stream_turn(state, prompt, model, display_model).await
    } else {
        buffered_turn(state, prompt, model, display_model).await
    }
}

async fn buffered_turn(
    state: Arc<AppState>,
    prompt: String,
    model: Option<String>,
    display_model: String,
) -> Response {
    let result = state
        .coordinator
        .run_http_turn(TurnRequest {
            conversation_id: HTTP_CONVERSATION_ID.to_string(),
            prompt,
            model,
            sink: None,
            cancel: None,
        })
        .await;

    let text = match result {
        Ok(TurnReply::Command(reply)) => reply,
        Ok(TurnReply::Completed(outcome)) => outcome.final_text,
        Err(err) => return bridge_error_response(&err),
    };

    let id = next_response_id();
    Json(completion_payload(&id, now_unix(), &display_model, &text)).into_response()
}

async fn stream_turn(
    state: Arc<AppState>,
    prompt: String,
    model: Option<String>,
    display_model: String,
) -> Response {
    let id = next_response_id();
    let created = now_unix();

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let streamed = Arc::new(Mutex::new(String::new()));
    let got_delta = Arc::new(AtomicBool::new(false));

    let sink: DeltaSink = {
        let tx = tx.clone();
        let id = id.clone();
        let display_model = display_model.clone();
        let streamed = streamed.clone();
        let got_delta = got_delta.clone();
        Arc::new(move |delta: &str| {
            got_delta.store(true, Ordering::Relaxed);
            streamed.lock().unwrap().push_str(delta);
            let chunk = content_chunk(&id, created, &display_model, delta);
            let _ = tx.send(Event::default().data(chunk.to_string()));
        })
    };

    // until the first real delta arrives, an empty-content chunk every 5 s
    // keeps intermediaries from timing the stream out
    let keepalive = {
        let tx = tx.clone();
        let id = id.clone();
        let display_model = display_model.clone();
        let got_delta = got_delta.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
                KEEPALIVE_INTERVAL,
            );
            loop {
                ticker.tick().await;
                if got_delta.load(Ordering::Relaxed) {
                    break;
                }
                let chunk = content_chunk(&id, created, &display_model, "");
                if tx.send(Event::default().data(chunk.to_string())).is_err() {
                    break;
                }
            }
        })
    };

    {
        let coordinator = state.coordinator.clone();
        let id = id.clone();
        let display_model = display_model.clone();
        tokio::spawn(async move {
            let result = coordinator
                .run_http_turn(TurnRequest {
                    conversation_id: HTTP_CONVERSATION_ID.to_string(),
                    prompt,
                    model,
                    sink: Some(sink),
                    cancel: Some(cancel_rx),
                })
                .await;
            keepalive.abort();

            match result {
                Ok(reply) => {
                    let final_text = match reply {
                        TurnReply::Command(text) => text,
                        TurnReply::Completed(outcome) => outcome.final_text,
                    };
                    // emit whatever tail the deltas did not cover
                    let streamed = streamed.lock().unwrap().clone();
                    let tail = if final_text.starts_with(&streamed) {
                        &final_text[streamed.len()..]
                    } else if streamed.is_empty() {
                        final_text.as_str()
                    } else {
                        ""
                    };
                    if !tail.is_empty() {
                        let chunk = content_chunk(&id, created, &display_model, tail);
                        let _ = tx.send(Event::default().data(chunk.to_string()));
                    }
                    let done = final_chunk(&id, created, &display_model);
                    let _ = tx.send(Event::default().data(done.to_string()));
                    let _ = tx.send(Event::default().data("[DONE]"));
                }
                Err(err) if err.is_aborted() => {
                    // the client went away; no further frames
                    tracing::debug!("streaming turn cancelled");
                }
                Err(err) => {
                    // headers are long gone; surface the failure in-band
                    let chunk = content_chunk(
                        &id,
                        created,
                        &display_model,
                        &format!("Error: {err}"),
                    );
                    let _ = tx.send(Event::default().data(chunk.to_string()));
                    let _ = tx.send(Event::default().data("[DONE]"));
                }
            }
        });
    }

    let guard = DisconnectGuard(cancel_tx);
    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _keep = &guard;
        Ok::<Event, Infallible>(event)
    });

    (
        [("x-accel-buffering", "no")],
        Sse::new(stream),
    )
        .into_response()
}

/// Trips the turn's cancellation token when the response stream is dropped.
struct DisconnectGuard(watch::Sender<bool>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}
