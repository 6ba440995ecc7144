//! Wire types for the JSONL event streams the agent CLIs emit.
//!
//! Every field that a CLI may omit is `#[serde(default)]` so a single struct
//! can absorb all event shapes without failing the line.

use serde::Deserialize;

/// One line of the claude CLI's stream-JSON output.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Inner SSE-style event, present on `stream_event` lines.
    #[serde(default)]
    pub event: Option<ClaudeInnerEvent>,
    /// Final result text, present on `result` lines.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub rate_limit: Option<ClaudeRateLimit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeInnerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub delta: Option<ClaudeDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeDelta {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeRateLimit {
    #[serde(default)]
    pub status: Option<String>,
}

impl ClaudeEvent {
    /// Text of a `text_delta` stream event, if this line carries one.
    pub fn delta_text(&self) -> Option<&str> {
        let inner = self.event.as_ref()?;
        let delta = inner.delta.as_ref()?;
        if delta.kind != "text_delta" {
            return None;
        }
        delta.text.as_deref().filter(|text| !text.is_empty())
    }
}

/// One line of `codex exec --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct CodexEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub item: Option<CodexItem>,
    #[serde(default)]
    pub usage: Option<CodexUsage>,
    #[serde(default)]
    pub error: Option<CodexErrorInfo>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodexItem {
    #[serde(rename = "type", alias = "item_type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl CodexItem {
    pub fn is_agent_message(&self) -> bool {
        self.kind.as_deref() == Some("agent_message")
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodexErrorInfo {
    #[serde(default)]
    pub message: String,
}

impl CodexEvent {
    /// Error text carried by `turn.failed` or bare `error` events.
    pub fn error_message(&self) -> Option<String> {
        if let Some(error) = &self.error {
            if !error.message.is_empty() {
                return Some(error.message.clone());
            }
        }
        self.message.clone().filter(|message| !message.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_claude_init_event() {
        let json = r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "system");
        assert_eq!(event.subtype.as_deref(), Some("init"));
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn parse_claude_text_delta() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hel"}}}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.delta_text(), Some("hel"));
    }

    #[test]
    fn non_text_delta_is_ignored() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","text":"{}"}}}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.delta_text(), None);
    }

    #[test]
    fn parse_claude_result_with_cost() {
        let json =
            r#"{"type":"result","result":"done","session_id":"sess-2","total_cost_usd":0.042}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "result");
        assert_eq!(event.result.as_deref(), Some("done"));
        assert_eq!(event.total_cost_usd, Some(0.042));
    }

    #[test]
    fn parse_claude_rate_limit() {
        let json = r#"{"type":"system","subtype":"status","rate_limit":{"status":"throttled"}}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        let status = event.rate_limit.unwrap().status;
        assert_eq!(status.as_deref(), Some("throttled"));
    }

    #[test]
    fn parse_codex_thread_started() {
        let json = r#"{"type":"thread.started","thread_id":"T42"}"#;
        let event: CodexEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "thread.started");
        assert_eq!(event.thread_id.as_deref(), Some("T42"));
    }

    #[test]
    fn parse_codex_agent_message_with_item_type_alias() {
        let json = r#"{"type":"item.completed","item":{"item_type":"agent_message","id":"item_0","text":"hello"}}"#;
        let event: CodexEvent = serde_json::from_str(json).unwrap();
        let item = event.item.unwrap();
        assert!(item.is_agent_message());
        assert_eq!(item.text.as_deref(), Some("hello"));
    }

    #[test]
    fn parse_codex_turn_failed() {
        let json = r#"{"type":"turn.failed","error":{"message":"model overloaded"}}"#;
        let event: CodexEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.error_message().as_deref(), Some("model overloaded"));
    }

    #[test]
    fn parse_codex_usage() {
        let json = r#"{"type":"turn.completed","usage":{"input_tokens":12,"output_tokens":7}}"#;
        let event: CodexEvent = serde_json::from_str(json).unwrap();
        let usage = event.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 7);
    }
}
