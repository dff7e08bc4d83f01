//! `LmTransport` implementation against an Anthropic-Messages-API-shaped
//! backend (spec §4.6), grounded in
//! `crates/providers/anthropic/src/lib.rs`'s `HTTPChatProvider` impl.

use async_trait::async_trait;
use futures::StreamExt;
use meridian_core::{CoreError, FinalMessage, InvokeRequest, LmTransport, ProgressSink, StreamChunk};

use crate::config::AnthropicConfig;
use crate::wire::{
    into_final_message, to_wire_message, to_wire_tool, ResponseEnvelope, StreamEventBuffer, WireRequest,
};

pub struct AnthropicTransport {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicTransport {
    pub fn new(config: AnthropicConfig) -> Self {
        AnthropicTransport { config, http: reqwest::Client::new() }
    }

    fn messages_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/messages")
    }

    fn build_request<'a>(&'a self, request: &InvokeRequest<'a>, stream: bool) -> WireRequest<'a> {
        WireRequest {
            model: &self.config.model,
            max_tokens: if request.max_tokens > 0 { request.max_tokens } else { self.config.max_tokens },
            system: if request.system.is_empty() { None } else { Some(request.system) },
            messages: request.messages.iter().map(to_wire_message).collect(),
            tools: if request.tools.is_empty() { None } else { Some(request.tools.iter().map(to_wire_tool).collect()) },
            stream: if stream { Some(true) } else { None },
        }
    }

    async fn send(&self, body: &WireRequest<'_>) -> Result<reqwest::Response, CoreError> {
        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.anthropic_version)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout { operation: "anthropic messages call".to_string(), elapsed_ms: 0 }
                } else {
                    CoreError::Transport { target: "anthropic".to_string(), reason: e.to_string() }
                }
            })?;

        if !response.status().is_success() {
            return Err(CoreError::HttpStatus {
                target: "anthropic".to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LmTransport for AnthropicTransport {
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<FinalMessage, CoreError> {
        let body = self.build_request(&request, false);
        let response = self.send(&body).await?;
        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|e| CoreError::Transport { target: "anthropic".to_string(), reason: e.to_string() })?;
        Ok(into_final_message(envelope))
    }

    async fn invoke_streaming(
        &self,
        request: InvokeRequest<'_>,
        on_progress: ProgressSink<'_>,
    ) -> Result<FinalMessage, CoreError> {
        let body = self.build_request(&request, true);
        let response = self.send(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = StreamEventBuffer::default();
        let mut text_blocks: Vec<String> = Vec::new();
        let mut tool_blocks: std::collections::BTreeMap<usize, (String, String, String)> = std::collections::BTreeMap::new();
        let mut stop_reason = meridian_core::StopReason::EndTurn;
        let mut usage = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CoreError::Transport { target: "anthropic".to_string(), reason: e.to_string() })?;
            let events = buffer.feed(&String::from_utf8_lossy(&chunk));

            for event in events {
                match &event {
                    StreamChunk::TextDelta { text } => text_blocks.push(text.clone()),
                    StreamChunk::ToolUseStart { index, id, name } => {
                        tool_blocks.insert(*index, (id.clone(), name.clone(), String::new()));
                    }
                    StreamChunk::ToolUseInputDelta { index, partial_json } => {
                        if let Some(entry) = tool_blocks.get_mut(index) {
                            entry.2.push_str(partial_json);
                        }
                    }
                    StreamChunk::Usage { usage: u } => usage = Some(*u),
                    StreamChunk::Done { stop_reason: reason } => stop_reason = reason.clone(),
                    StreamChunk::ToolUseComplete { .. } => {}
                }
                on_progress(event);
            }
        }

        let mut content = Vec::new();
        if !text_blocks.is_empty() {
            content.push(meridian_core::ContentBlock::Text { text: text_blocks.join("") });
        }
        for (_, (id, name, raw_json)) in tool_blocks {
            let input = serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Object(Default::default()));
            content.push(meridian_core::ContentBlock::ToolUse { id, name, input });
        }

        Ok(FinalMessage { content, stop_reason, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{ChatMessage, Tool};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(base_url: String) -> AnthropicConfig {
        AnthropicConfig {
            api_key: "sk-test".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 1024,
            base_url,
            anthropic_version: "2023-06-01".to_string(),
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn invoke_parses_text_and_tool_use_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "looking that up"},
                    {"type": "tool_use", "id": "call_1", "name": "search", "input": {"q": "rust"}}
                ],
                "stop_reason": "tool_use",
                "usage": {"input_tokens": 10, "output_tokens": 5}
            })))
            .mount(&server)
            .await;

        let transport = AnthropicTransport::new(config_for(server.uri()));
        let messages = vec![ChatMessage::user_text("search for rust")];
        let tools = vec![Tool { name: "search".into(), description: "search the web".into(), input_schema: serde_json::json!({}) }];
        let request = InvokeRequest { model: "claude-sonnet-4-20250514", max_tokens: 1024, system: "", messages: &messages, tools: &tools };

        let result = transport.invoke(request).await.unwrap();
        assert_eq!(result.text_content(), "looking that up");
        assert_eq!(result.tool_use_blocks().len(), 1);
        assert_eq!(result.usage.unwrap().input_tokens, 10);
        assert!(matches!(result.stop_reason, meridian_core::StopReason::ToolUse));
    }

    #[tokio::test]
    async fn non_success_status_surfaces_as_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let transport = AnthropicTransport::new(config_for(server.uri()));
        let messages = vec![ChatMessage::user_text("hi")];
        let request = InvokeRequest { model: "m", max_tokens: 10, system: "", messages: &messages, tools: &[] };

        let err = transport.invoke(request).await.unwrap_err();
        assert!(matches!(err, CoreError::HttpStatus { status: 429, .. }));
    }
}
