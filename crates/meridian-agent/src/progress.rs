//! Progress Fan-out (spec §4.9): in-process callbacks plus an optional
//! external-webhook relay with four delivery modes. Grounded in
//! `crates/service/src/main.rs`'s `StreamState`/`render_stream_chunk`
//! scan-based construction, generalized from OpenAI-chunk shapes to this
//! engine's `{status,progress,tool_use,tool_result,complete,error}` event
//! shapes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// One event in the causal order described in spec §4.8.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status { message: String },
    Progress { text: String },
    ToolUse { tool: String, input: Value },
    ToolResult { tool: String, result: Value },
    Complete { response: String },
    Error { error: String },
}

/// Callback surface handed to the Orchestrator (spec §4.9). All hooks are
/// optional; a sink that only cares about the terminal event can leave the
/// rest as no-ops.
pub trait ProgressSink: Send + Sync {
    fn on_status(&self, _message: &str) {}
    fn on_progress(&self, _text: &str) {}
    fn on_tool_use(&self, _tool: &str, _input: &Value) {}
    fn on_tool_result(&self, _tool: &str, _result: &Value) {}
    fn on_iteration_complete(&self, _text: &str) {}
    fn on_complete(&self, _response: &str) {}
    fn on_error(&self, _error: &str) {}
}

/// A sink with no behavior, for callers that don't need progress delivery.
pub struct NoopSink;
impl ProgressSink for NoopSink {}

/// Forwards every callback as a `ProgressEvent` onto an mpsc channel — the
/// in-process half of the fan-out, consumed by an SSE handler in
/// `meridian-service`.
pub struct ChannelSink {
    sender: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        ChannelSink { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn on_status(&self, message: &str) {
        let _ = self.sender.send(ProgressEvent::Status { message: message.to_string() });
    }
    fn on_progress(&self, text: &str) {
        let _ = self.sender.send(ProgressEvent::Progress { text: text.to_string() });
    }
    fn on_tool_use(&self, tool: &str, input: &Value) {
        let _ = self.sender.send(ProgressEvent::ToolUse { tool: tool.to_string(), input: input.clone() });
    }
    fn on_tool_result(&self, tool: &str, result: &Value) {
        let _ = self.sender.send(ProgressEvent::ToolResult { tool: tool.to_string(), result: result.clone() });
    }
    fn on_complete(&self, response: &str) {
        let _ = self.sender.send(ProgressEvent::Complete { response: response.to_string() });
    }
    fn on_error(&self, error: &str) {
        let _ = self.sender.send(ProgressEvent::Error { error: error.to_string() });
    }
}

/// Delivery mode for the external-webhook relay (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMode {
    Complete,
    Iteration,
    Periodic { period: Duration },
    Sentence,
}

/// Minimum periodic-mode interval (spec §4.9: `T_min = 1s`).
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(1);

impl WebhookMode {
    pub fn periodic(seconds: f64) -> Self {
        let period = Duration::from_secs_f64(seconds.max(MIN_PERIODIC_INTERVAL.as_secs_f64()));
        WebhookMode::Periodic { period }
    }
}

/// POSTs accumulated progress text to a client-supplied URL according to
/// `mode`. Webhook failures are logged and swallowed (spec §4.9, §7): they
/// must never abort the request.
pub struct WebhookRelay {
    http: reqwest::Client,
    url: String,
    mode: WebhookMode,
    buffer: tokio::sync::Mutex<RelayState>,
}

struct RelayState {
    accumulated: String,
    last_flush: Instant,
}

impl WebhookRelay {
    pub fn new(url: impl Into<String>, mode: WebhookMode) -> Self {
        WebhookRelay {
            http: reqwest::Client::new(),
            url: url.into(),
            mode,
            buffer: tokio::sync::Mutex::new(RelayState { accumulated: String::new(), last_flush: Instant::now() }),
        }
    }

    /// Call once per text delta / iteration boundary; decides whether this
    /// chunk triggers a flush under the configured mode.
    pub async fn on_text(&self, text: &str, iteration_boundary: bool) {
        let mut state = self.buffer.lock().await;
        state.accumulated.push_str(text);

        let should_flush = match self.mode {
            WebhookMode::Complete => false,
            WebhookMode::Iteration => iteration_boundary,
            WebhookMode::Periodic { period } => state.last_flush.elapsed() >= period,
            WebhookMode::Sentence => sentence_boundary(&state.accumulated).is_some(),
        };

        if should_flush {
            let to_send = match self.mode {
                WebhookMode::Sentence => {
                    let cut = sentence_boundary(&state.accumulated).unwrap_or(state.accumulated.len());
                    let sent = state.accumulated[..cut].to_string();
                    state.accumulated = state.accumulated[cut..].to_string();
                    sent
                }
                _ => std::mem::take(&mut state.accumulated),
            };
            state.last_flush = Instant::now();
            drop(state);
            self.post(ProgressEvent::Progress { text: to_send }).await;
        }
    }

    pub async fn on_complete(&self, response: &str) {
        let remainder = {
            let mut state = self.buffer.lock().await;
            std::mem::take(&mut state.accumulated)
        };
        if !remainder.is_empty() {
            self.post(ProgressEvent::Progress { text: remainder }).await;
        }
        self.post(ProgressEvent::Complete { response: response.to_string() }).await;
    }

    async fn post(&self, event: ProgressEvent) {
        if let Err(error) = self.http.post(&self.url).json(&event).send().await {
            tracing::warn!(url = %self.url, %error, "progress webhook delivery failed");
        }
    }
}

/// Finds the first sentence-ending punctuation (`.`, `!`, `?`) followed by
/// whitespace or end-of-input (spec §4.9 sentence mode), returning the
/// byte offset just past it.
fn sentence_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let next = bytes.get(i + 1);
            if next.is_none() || next.map(|c| c.is_ascii_whitespace()).unwrap_or(false) {
                return Some(i + 1);
            }
        }
    }
    None
}

/// Combines an in-process sink with an optional webhook relay — both fed
/// from the same Orchestrator callback points.
pub struct ProgressFanout {
    pub sink: Arc<dyn ProgressSink>,
    pub webhook: Option<Arc<WebhookRelay>>,
}

impl ProgressFanout {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        ProgressFanout { sink, webhook: None }
    }

    pub fn with_webhook(mut self, webhook: Arc<WebhookRelay>) -> Self {
        self.webhook = Some(webhook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_boundary_requires_trailing_whitespace_or_eof() {
        assert_eq!(sentence_boundary("Hello world."), Some(12));
        assert_eq!(sentence_boundary("Hello world. And more"), Some(12));
        assert_eq!(sentence_boundary("3.14 is pi"), None);
        assert_eq!(sentence_boundary("no punctuation"), None);
    }

    #[test]
    fn periodic_mode_clamps_to_minimum_interval() {
        let mode = WebhookMode::periodic(0.1);
        match mode {
            WebhookMode::Periodic { period } => assert_eq!(period, MIN_PERIODIC_INTERVAL),
            _ => panic!("expected periodic mode"),
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards_every_callback_as_an_event() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.on_status("starting");
        sink.on_complete("done");
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProgressEvent::Status { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ProgressEvent::Complete { .. }));
        assert!(rx.recv().await.is_none());
    }
}
