use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Coarse classification of a bridge failure, used to pick the HTTP status
/// and the OpenAI-style `error.type` string.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    BackendExited,
    Timeout,
    Unavailable,
    Internal,
}

impl ErrorType {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::BackendExited => 502,
            Self::Timeout => 504,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }

    /// The `error.type` value OpenAI clients expect.
    pub fn as_openai_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::BackendExited | Self::Timeout | Self::Unavailable | Self::Internal => {
                "server_error"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("backend is not running")]
    NotRunning,
    #[error("a turn is already in flight for this session")]
    Busy,
    #[error("turn timed out")]
    Timeout,
    #[error("turn failed: {message}")]
    TurnFailed { message: String },
    #[error("backend exited{}", format_exit(.code))]
    ChildExited {
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("turn aborted")]
    Aborted,
    #[error("failed to spawn backend `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write to backend stdin: {0}")]
    StdinWrite(#[source] std::io::Error),
    #[error("{message}")]
    Internal { message: String },
}

fn format_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit {code})"),
        None => String::new(),
    }
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::ChildExited { .. } | Self::Spawn { .. } | Self::StdinWrite(_) => {
                ErrorType::BackendExited
            }
            Self::Timeout => ErrorType::Timeout,
            Self::NotRunning | Self::Busy => ErrorType::Unavailable,
            Self::TurnFailed { .. } | Self::Aborted | Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_type().status_code()
    }

    /// True when the turn should be silently discarded instead of reported.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Render the OpenAI-compatible error body.
    pub fn to_openai_body(&self) -> Value {
        openai_error_body(&self.to_string(), self.error_type())
    }
}

/// Build an OpenAI-shape error body from a bare message.
pub fn openai_error_body(message: &str, error_type: ErrorType) -> Value {
    json!({
        "error": {
            "message": message,
            "type": error_type.as_openai_type(),
            "code": null,
        }
    })
}
