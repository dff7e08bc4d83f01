//! Structured, serializable error taxonomy shared across the orchestration
//! core (spec §7).
//!
//! Every variant corresponds to a row of the spec's error taxonomy. Variants
//! that cross the sandbox/host or tool-dispatch boundary derive
//! `Serialize`/`Deserialize` so they can be carried into `tool_result`
//! payloads and event-stream frames verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CoreError {
    // --- Client / tool input validation ---
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    // --- Transport / protocol ---
    #[error("transport error calling {target}: {reason}")]
    Transport { target: String, reason: String },

    #[error("http status {status} from {target}")]
    HttpStatus { target: String, status: u16 },

    #[error("protocol error {code} from {target}: {message}")]
    Protocol {
        target: String,
        code: i64,
        message: String,
    },

    #[error("response from {target} exceeded {limit} bytes (got {actual})")]
    ResponseTooLarge {
        target: String,
        actual: u64,
        limit: u64,
    },

    #[error("request cancelled")]
    Cancelled,

    // --- Timeouts ---
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    // --- Sandbox ---
    #[error("sandbox re-entry limit exceeded: made {made}, limit {limit}")]
    CallLimitExceeded { made: u32, limit: u32 },

    #[error("sandbox execution error: {message}")]
    ExecutionError { message: String },

    #[error("script rejected: {reason}")]
    InvalidScript { reason: String },

    // --- Budget / health ---
    #[error("downstream call budget exceeded: {used}/{limit}")]
    BudgetExceeded { used: u32, limit: u32 },

    #[error("server unhealthy: {server_id}")]
    ServerUnhealthy { server_id: String },

    // --- Generic ---
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        let target = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if e.is_timeout() {
            CoreError::Timeout {
                operation: format!("request to {target}"),
                elapsed_ms: 0,
            }
        } else {
            CoreError::Transport {
                target,
                reason: e.to_string(),
            }
        }
    }
}

/// Short machine-readable code, used as `error_code` in `execute_code`
/// failures and as the `error` discriminant in error-carrying JSON payloads.
impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::UnknownTool { .. } => "UNKNOWN_TOOL",
            CoreError::Transport { .. } => "TRANSPORT_ERROR",
            CoreError::HttpStatus { .. } => "HTTP_STATUS",
            CoreError::Protocol { .. } => "PROTOCOL_ERROR",
            CoreError::ResponseTooLarge { .. } => "RESPONSE_TOO_LARGE",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::CallLimitExceeded { .. } => "CALL_LIMIT_EXCEEDED",
            CoreError::ExecutionError { .. } => "EXECUTION_ERROR",
            CoreError::InvalidScript { .. } => "INVALID_SCRIPT",
            CoreError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            CoreError::ServerUnhealthy { .. } => "SERVER_UNHEALTHY",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
