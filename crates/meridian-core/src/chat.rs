//! The LM-facing message and tool-use data model (spec §3, §4.6).
//!
//! Messages carry structured content: a sequence of blocks, each either a
//! text block or a tool-use/tool-result block. This mirrors the wire shape
//! the Orchestrator builds and tears down on every iteration rather than a
//! single-typed-message model, since a single assistant turn can carry both
//! prose and one or more tool-use blocks at once.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Role of a participant in the LM message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One block of structured message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single message in the LM message log (spec §3 "LM message log").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user_tool_results(results: Vec<ContentBlock>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: results,
        }
    }

    /// All text blocks concatenated, used to build `responses[]`.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_use_blocks(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect()
    }
}

/// A tool definition as surfaced to the LM (spec §4.6 `tools`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Token accounting reported by the LM, when available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Stop reason surfaced by the LM. Anything other than `EndTurn`/`ToolUse`
/// is folded into `Other` and treated equivalently to `EndTurn` by the
/// Orchestrator (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Other(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::ToolUse => write!(f, "tool_use"),
            StopReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// The complete assistant message returned by a call to the LM, whether it
/// arrived unary or was reassembled from a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

impl FinalMessage {
    pub fn tool_use_blocks(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect()
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Incremental streaming events from the LM Transport (spec §4.6 streaming
/// mode). Tool-use blocks are delivered complete, never token-by-token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta { text: String },
    ToolUseStart { index: usize, id: String, name: String },
    ToolUseInputDelta { index: usize, partial_json: String },
    ToolUseComplete { index: usize, block: ContentBlock },
    Usage { usage: Usage },
    Done { stop_reason: StopReason },
}

/// One call to the LM (spec §4.6 contract).
#[derive(Debug, Clone)]
pub struct InvokeRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [Tool],
}

/// Sink for incremental progress during a streaming LM call.
pub type ProgressSink<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, CoreError>> + Send>>;

/// Transport to a remote LM (spec §4.6). Implementations provide at least
/// `invoke`; streaming support is optional and gated by
/// [`LmTransport::supports_streaming`].
#[async_trait]
pub trait LmTransport: Send + Sync {
    fn supports_streaming(&self) -> bool {
        false
    }

    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<FinalMessage, CoreError>;

    /// Streaming invocation. Deltas are delivered to `on_progress` as they
    /// arrive; the fully assembled message is returned on completion.
    /// Providers that don't support streaming fall back to `invoke` and
    /// replay it as a single `TextDelta` plus `Done`.
    async fn invoke_streaming(
        &self,
        request: InvokeRequest<'_>,
        on_progress: ProgressSink<'_>,
    ) -> Result<FinalMessage, CoreError> {
        let message = self.invoke(request).await?;
        let text = message.text_content();
        if !text.is_empty() {
            on_progress(StreamChunk::TextDelta { text });
        }
        on_progress(StreamChunk::Done {
            stop_reason: message.stop_reason.clone(),
        });
        Ok(message)
    }
}
