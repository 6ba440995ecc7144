//! OpenAI chat-completions wire shapes: request parsing and payload builders.

use serde::Deserialize;
use serde_json::{json, Value};

use agent_bridge_error::BridgeError;

pub const CHAT_COMPLETION_OBJECT: &str = "chat.completion";
pub const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const MODEL_OWNER: &str = "agent-bridge";

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Value,
    /// Streaming is the default; only an explicit `false` disables it.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatCompletionsRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream != Some(false)
    }
}

/// Pull the prompt out of an OpenAI-style message list: the latest user
/// message, with text blocks joined by newlines and other block types
/// ignored.
pub fn extract_prompt(messages: &Value) -> Result<String, BridgeError> {
    let messages = match messages {
        Value::Array(messages) if !messages.is_empty() => messages,
        _ => {
            return Err(BridgeError::InvalidRequest {
                message: "messages must include at least one item".to_string(),
            })
        }
    };

    for message in messages.iter().rev() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        if role != "user" {
            continue;
        }
        let content = message.get("content").cloned().unwrap_or(Value::Null);
        return Ok(flatten_content(&content));
    }

    Err(BridgeError::InvalidRequest {
        message: "no user message found".to_string(),
    })
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
                if kind != "text" {
                    continue;
                }
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn zero_usage() -> Value {
    json!({
        "prompt_tokens": 0,
        "completion_tokens": 0,
        "total_tokens": 0,
    })
}

/// One streaming chunk carrying incremental content.
pub fn content_chunk(id: &str, created: i64, model: &str, content: &str) -> Value {
    json!({
        "id": id,
        "object": CHAT_COMPLETION_CHUNK_OBJECT,
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": content },
            "finish_reason": Value::Null,
        }],
    })
}

/// The terminal streaming chunk: empty delta, stop reason, zeroed usage.
pub fn final_chunk(id: &str, created: i64, model: &str) -> Value {
    json!({
        "id": id,
        "object": CHAT_COMPLETION_CHUNK_OBJECT,
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": "stop",
        }],
        "usage": zero_usage(),
    })
}

/// The non-streaming response object.
pub fn completion_payload(id: &str, created: i64, model: &str, text: &str) -> Value {
    json!({
        "id": id,
        "object": CHAT_COMPLETION_OBJECT,
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop",
        }],
        "usage": zero_usage(),
    })
}

pub fn model_entry(id: &str) -> Value {
    json!({
        "id": id,
        "object": "model",
        "owned_by": MODEL_OWNER,
    })
}

pub fn models_payload(ids: &[String]) -> Value {
    json!({
        "object": "list",
        "data": ids.iter().map(|id| model_entry(id)).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_user_message_wins() {
        let messages = json!([
            {"role": "user", "content": "first"},
            {"role": "assistant", "content": "reply"},
            {"role": "user", "content": "second"},
        ]);
        assert_eq!(extract_prompt(&messages).unwrap(), "second");
    }

    #[test]
    fn content_blocks_concatenate_text_only() {
        let messages = json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "line two"},
            ],
        }]);
        assert_eq!(extract_prompt(&messages).unwrap(), "line one\nline two");
    }

    #[test]
    fn empty_messages_rejected() {
        assert!(extract_prompt(&json!([])).is_err());
        assert!(extract_prompt(&Value::Null).is_err());
    }

    #[test]
    fn missing_user_message_rejected() {
        let messages = json!([{"role": "system", "content": "be nice"}]);
        let err = extract_prompt(&messages).unwrap_err();
        assert!(err.to_string().contains("no user message"));
    }

    #[test]
    fn stream_defaults_on() {
        let request: ChatCompletionsRequest =
            serde_json::from_value(json!({"messages": []})).unwrap();
        assert!(request.wants_stream());
        let request: ChatCompletionsRequest =
            serde_json::from_value(json!({"messages": [], "stream": false})).unwrap();
        assert!(!request.wants_stream());
        let request: ChatCompletionsRequest =
            serde_json::from_value(json!({"messages": [], "stream": true})).unwrap();
        assert!(request.wants_stream());
    }

    #[test]
    fn chunk_shapes() {
        let chunk = content_chunk("chatcmpl-1", 123, "claude-code", "he");
        assert_eq!(chunk["object"], CHAT_COMPLETION_CHUNK_OBJECT);
        assert_eq!(chunk["choices"][0]["delta"]["content"], "he");
        assert_eq!(chunk["choices"][0]["finish_reason"], Value::Null);

        let done = final_chunk("chatcmpl-1", 123, "claude-code");
        assert_eq!(done["choices"][0]["delta"], json!({}));
        assert_eq!(done["choices"][0]["finish_reason"], "stop");
        assert_eq!(done["usage"]["total_tokens"], 0);
    }

    #[test]
    fn completion_shape() {
        let payload = completion_payload("chatcmpl-2", 456, "codex", "hello");
        assert_eq!(payload["object"], CHAT_COMPLETION_OBJECT);
        assert_eq!(payload["choices"][0]["message"]["content"], "hello");
        assert_eq!(payload["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn models_list_shape() {
        let payload = models_payload(&["claude-code".to_string(), "codex".to_string()]);
        assert_eq!(payload["object"], "list");
        assert_eq!(payload["data"][0]["id"], "claude-code");
        assert_eq!(payload["data"][1]["object"], "model");
    }
}
