//! Agent-level error taxonomy, layered on top of `meridian_core::CoreError`
//! (spec §7), styled after `crates/agent/src/error.rs`.

use meridian_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AgentError {
    // ── request validation ───────────────────────────────────────
    #[error("user_id must not be empty")]
    EmptyUserId,
    #[error("client_id must not be empty")]
    EmptyClientId,
    #[error("message must not be empty after trimming")]
    EmptyMessage,
    #[error("response_language must match ^[a-z]{{2}}$, got {value:?}")]
    InvalidResponseLanguage { value: String },

    // ── orchestration core ───────────────────────────────────────
    #[error(transparent)]
    Core(#[from] CoreError),

    // ── session actor ────────────────────────────────────────────
    #[error("session actor for key {key} did not respond")]
    ActorUnreachable { key: String },
    #[error("request cancelled")]
    Cancelled,
}
