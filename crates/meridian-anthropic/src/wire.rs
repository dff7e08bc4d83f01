//! Wire-format request/response/stream-event types for the Anthropic
//! Messages API, adapted from `crates/providers/anthropic/src/lib.rs` to
//! the block-sequence `ContentBlock` model (spec §3).

use std::collections::HashMap;

use meridian_core::{ChatMessage, ChatRole, ContentBlock, FinalMessage, StopReason, StreamChunk, Tool, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Debug)]
pub(crate) struct WireTool<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub input_schema: &'a Value,
}

#[derive(Serialize, Debug)]
pub(crate) struct WireRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Serialize, Debug)]
pub(crate) struct WireMessage<'a> {
    pub role: &'a str,
    pub content: Vec<WireContent<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub(crate) enum WireContent<'a> {
    #[serde(rename = "text")]
    Text { text: &'a str },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

pub(crate) fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

pub(crate) fn to_wire_message(message: &ChatMessage) -> WireMessage<'_> {
    WireMessage {
        role: role_str(message.role),
        content: message
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => WireContent::Text { text },
                ContentBlock::ToolUse { id, name, input } => WireContent::ToolUse { id, name, input },
                ContentBlock::ToolResult { tool_use_id, content, is_error } => WireContent::ToolResult {
                    tool_use_id,
                    content,
                    is_error: if *is_error { Some(true) } else { None },
                },
            })
            .collect(),
    }
}

pub(crate) fn to_wire_tool(tool: &Tool) -> WireTool<'_> {
    WireTool {
        name: &tool.name,
        description: &tool.description,
        input_schema: &tool.input_schema,
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct ResponseContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub input: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ResponseEnvelope {
    pub content: Vec<ResponseContent>,
    pub stop_reason: Option<String>,
    pub usage: Option<ResponseUsage>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub(crate) struct ResponseUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub(crate) fn wire_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

pub(crate) fn into_final_message(envelope: ResponseEnvelope) -> FinalMessage {
    let content = envelope
        .content
        .into_iter()
        .filter_map(|c| match c.content_type.as_str() {
            "text" => Some(ContentBlock::Text { text: c.text.unwrap_or_default() }),
            "tool_use" => Some(ContentBlock::ToolUse {
                id: c.id.unwrap_or_default(),
                name: c.name.unwrap_or_default(),
                input: c.input.unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect();
    FinalMessage {
        content,
        stop_reason: wire_stop_reason(envelope.stop_reason.as_deref()),
        usage: envelope.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub index: Option<usize>,
    pub content_block: Option<StreamContentBlock>,
    pub delta: Option<StreamDelta>,
    pub usage: Option<ResponseUsage>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct StreamContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct StreamDelta {
    #[serde(rename = "type")]
    pub delta_type: Option<String>,
    pub text: Option<String>,
    pub partial_json: Option<String>,
    pub stop_reason: Option<String>,
}

/// Parses one SSE frame's accumulated `data:` lines into the chunks the
/// orchestrator's progress sink understands, mirroring
/// `parse_chat_stream_chunk` in the teacher's Anthropic provider.
pub(crate) fn parse_stream_events(body: &str) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    let mut tool_use_indices: HashMap<usize, ()> = HashMap::new();

    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(data) else { continue };

        match event.event_type.as_str() {
            "content_block_start" => {
                if let (Some(index), Some(block)) = (event.index, event.content_block) {
                    if block.block_type == "tool_use" {
                        tool_use_indices.insert(index, ());
                        chunks.push(StreamChunk::ToolUseStart {
                            index,
                            id: block.id.unwrap_or_default(),
                            name: block.name.unwrap_or_default(),
                        });
                    }
                }
            }
            "content_block_delta" => {
                if let (Some(index), Some(delta)) = (event.index, event.delta) {
                    if let Some(text) = delta.text {
                        chunks.push(StreamChunk::TextDelta { text });
                    } else if let Some(partial_json) = delta.partial_json {
                        chunks.push(StreamChunk::ToolUseInputDelta { index, partial_json });
                    }
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage {
                    chunks.push(StreamChunk::Usage {
                        usage: Usage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        },
                    });
                }
                if let Some(delta) = event.delta {
                    if let Some(stop_reason) = delta.stop_reason {
                        chunks.push(StreamChunk::Done { stop_reason: wire_stop_reason(Some(&stop_reason)) });
                    }
                }
            }
            _ => {}
        }
    }
    chunks
}

/// Accumulates raw SSE bytes across network chunks and yields complete
/// events as they become parseable, holding back a trailing partial line
/// rather than dropping it (a chunk boundary can land mid-frame).
#[derive(Default)]
pub(crate) struct StreamEventBuffer {
    pending: String,
}

impl StreamEventBuffer {
    pub(crate) fn feed(&mut self, piece: &str) -> Vec<StreamChunk> {
        self.pending.push_str(piece);
        let complete_upto = self.pending.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let events = parse_stream_events(&self.pending[..complete_upto]);
        self.pending.drain(..complete_upto);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_turn_is_the_default_stop_reason() {
        assert!(matches!(wire_stop_reason(None), StopReason::EndTurn));
        assert!(matches!(wire_stop_reason(Some("end_turn")), StopReason::EndTurn));
    }

    #[test]
    fn unrecognized_stop_reasons_round_trip_through_other() {
        match wire_stop_reason(Some("max_tokens")) {
            StopReason::Other(s) => assert_eq!(s, "max_tokens"),
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn parses_text_and_tool_use_and_done_events() {
        let body = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"search\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{}\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"}}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = parse_stream_events(body);
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[0], StreamChunk::ToolUseStart { .. }));
        assert!(matches!(chunks[1], StreamChunk::ToolUseInputDelta { .. }));
        assert!(matches!(chunks[2], StreamChunk::Done { .. }));
    }

    #[test]
    fn stream_event_buffer_holds_back_a_line_split_across_chunks() {
        let mut buffer = StreamEventBuffer::default();
        let full_line = "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n";
        let (first_half, second_half) = full_line.split_at(20);

        let from_first = buffer.feed(first_half);
        assert!(from_first.is_empty(), "a partial line must not be parsed yet");

        let from_second = buffer.feed(second_half);
        assert_eq!(from_second.len(), 1);
        assert!(matches!(&from_second[0], StreamChunk::TextDelta { text } if text == "hi"));
    }
}
