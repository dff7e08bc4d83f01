//! Tool-Server Client (spec §4.1): JSON-RPC 2.0 over HTTP to remote tool
//! servers, with bounded response size and per-call timeouts.
//!
//! Hand-rolled against `reqwest` rather than built on the `rmcp` SDK: the
//! spec needs byte-counted streaming cancellation and a tolerant
//! envelope-unwrapping rule (a server that doesn't wrap its reply in
//! `{jsonrpc, result}` is still accepted), neither of which the official
//! client exposes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{DiscoveryResult, ServerConfig, ToolManifestEntry};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub timeout: Duration,
    pub max_response_bytes: u64,
}

/// Metadata a tool server may return alongside its result (spec §4.1, §3).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResultMeta {
    pub downstream_api_calls: Option<u32>,
    pub cache_status: Option<String>,
}

/// Outcome of one successful JSON-RPC call: the extracted result value plus
/// any `_meta` the server attached.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub value: Value,
    pub meta: Option<ResultMeta>,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: i64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// Reusable client for talking to tool servers. Builds one `reqwest::Client`
/// and reuses it across calls, following this codebase's
/// `RegistryClient`-style construction.
#[derive(Debug, Clone)]
pub struct ToolServerClient {
    http: reqwest::Client,
    next_id: std::sync::Arc<AtomicI64>,
}

impl Default for ToolServerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolServerClient {
    pub fn new() -> Self {
        ToolServerClient {
            http: reqwest::Client::new(),
            next_id: std::sync::Arc::new(AtomicI64::new(1)),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// JSON-RPC 2.0 POST to `server.url`, enforcing `max_response_bytes`
    /// without ever reading an oversize body into memory (spec §4.1).
    pub async fn call(
        &self,
        server: &ServerConfig,
        method: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<CallOutcome, CoreError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.allocate_id(),
        };

        let mut builder = self
            .http
            .post(&server.url)
            .timeout(opts.timeout)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(&request);

        if let Some(token) = &server.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| map_reqwest_error(&server.url, e))?;

        if !response.status().is_success() {
            return Err(CoreError::HttpStatus {
                target: server.url.clone(),
                status: response.status().as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > opts.max_response_bytes {
                return Err(CoreError::ResponseTooLarge {
                    target: server.url.clone(),
                    actual: len,
                    limit: opts.max_response_bytes,
                });
            }
        }

        let body = read_bounded(response, opts.max_response_bytes, &server.url).await?;
        let payload: Value = serde_json::from_slice(&body)?;
        parse_envelope(&server.url, payload)
    }

    /// Discovery entry point: `tools/list`, no params (spec §4.1).
    pub async fn discover(&self, server: &ServerConfig, timeout: Duration) -> DiscoveryResult {
        let opts = CallOptions {
            timeout,
            max_response_bytes: u64::MAX,
        };
        match self.call(server, "tools/list", Value::Object(Default::default()), opts).await {
            Ok(outcome) => match parse_tool_list(&outcome.value) {
                Ok(tools) => DiscoveryResult {
                    server_id: server.id.clone(),
                    tools,
                    error: None,
                },
                Err(e) => DiscoveryResult {
                    server_id: server.id.clone(),
                    tools: vec![],
                    error: Some(e.to_string()),
                },
            },
            Err(e) => DiscoveryResult {
                server_id: server.id.clone(),
                tools: vec![],
                error: Some(e.to_string()),
            },
        }
    }

    /// Invocation entry point: `tools/call` with `{name, arguments}` (spec
    /// §4.1). Extracts the text of the first `text`-typed content block if
    /// present, otherwise returns the raw `content`.
    pub async fn invoke_tool(
        &self,
        server: &ServerConfig,
        name: &str,
        arguments: Value,
        opts: CallOptions,
    ) -> Result<(String, Option<ResultMeta>), CoreError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let outcome = self.call(server, "tools/call", params, opts).await?;
        let text = extract_tool_result_text(&outcome.value);
        Ok((text, outcome.meta))
    }
}

async fn read_bounded(
    response: reqwest::Response,
    max_bytes: u64,
    target: &str,
) -> Result<Vec<u8>, CoreError> {
    let mut buffer = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_reqwest_error(target, e))?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() as u64 > max_bytes {
            return Err(CoreError::ResponseTooLarge {
                target: target.to_string(),
                actual: buffer.len() as u64,
                limit: max_bytes,
            });
        }
    }
    Ok(buffer)
}

fn map_reqwest_error(target: &str, e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout {
            operation: format!("call to {target}"),
            elapsed_ms: 0,
        }
    } else {
        CoreError::Transport {
            target: target.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Unwraps a JSON-RPC 2.0 envelope, tolerating servers that don't wrap their
/// reply at all (spec §4.1.4: "Otherwise treat the whole payload as the
/// result").
fn parse_envelope(target: &str, payload: Value) -> Result<CallOutcome, CoreError> {
    let is_jsonrpc = payload
        .get("jsonrpc")
        .and_then(Value::as_str)
        .map(|v| v == "2.0")
        .unwrap_or(false);

    if is_jsonrpc {
        if let Some(error) = payload.get("error") {
            let body: JsonRpcErrorBody = serde_json::from_value(error.clone())?;
            return Err(CoreError::Protocol {
                target: target.to_string(),
                code: body.code,
                message: body.message,
            });
        }
        if let Some(result) = payload.get("result") {
            let meta = result
                .get("_meta")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok());
            return Ok(CallOutcome {
                value: result.clone(),
                meta,
            });
        }
    }

    let meta = payload
        .get("_meta")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok());
    Ok(CallOutcome { value: payload, meta })
}

fn parse_tool_list(value: &Value) -> Result<Vec<ToolManifestEntry>, CoreError> {
    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::Protocol {
            target: "tools/list".to_string(),
            code: 0,
            message: "missing `tools` array in discovery response".to_string(),
        })?;

    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        let name = tool
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Protocol {
                target: "tools/list".to_string(),
                code: 0,
                message: "tool entry missing `name`".to_string(),
            })?
            .to_string();
        let description = tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input_schema = tool.get("input_schema").cloned().unwrap_or(Value::Null);
        out.push(ToolManifestEntry {
            name,
            description,
            input_schema,
        });
    }
    Ok(out)
}

fn extract_tool_result_text(value: &Value) -> String {
    if let Some(content) = value.get("content").and_then(Value::as_array) {
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        return text.to_string();
                    }
                }
            }
        }
        return content.to_string();
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server_config(url: String) -> ServerConfig {
        ServerConfig {
            id: "s1".into(),
            name: "s1".into(),
            url,
            auth_token: None,
            enabled: true,
            priority: 0,
            allowed_tools: vec![],
        }
    }

    fn opts() -> CallOptions {
        CallOptions {
            timeout: Duration::from_secs(5),
            max_response_bytes: 1_048_576,
        }
    }

    #[tokio::test]
    async fn successful_call_unwraps_result_field() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": { "ok": true },
                "id": 1
            })))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let outcome = client.call(&server, "ping", json!({}), opts()).await.unwrap();
        assert_eq!(outcome.value, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn non_enveloped_payload_is_treated_as_the_result() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "tools": [] })))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let outcome = client.call(&server, "tools/list", json!({}), opts()).await.unwrap();
        assert_eq!(outcome.value, json!({ "tools": [] }));
    }

    #[tokio::test]
    async fn jsonrpc_error_surfaces_as_protocol_error() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": { "code": -32601, "message": "method not found" },
                "id": 1
            })))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let err = client.call(&server, "bogus", json!({}), opts()).await.unwrap_err();
        match err {
            CoreError::Protocol { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_status_surfaces_as_http_status() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let err = client.call(&server, "ping", json!({}), opts()).await.unwrap_err();
        assert!(matches!(err, CoreError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn content_length_over_limit_fails_without_reading_body() {
        let mock = MockServer::start().await;
        let big = "x".repeat(2048);
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(big))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let small_opts = CallOptions {
            timeout: Duration::from_secs(5),
            max_response_bytes: 100,
        };
        let err = client.call(&server, "ping", json!({}), small_opts).await.unwrap_err();
        assert!(matches!(err, CoreError::ResponseTooLarge { .. }));
    }

    #[tokio::test]
    async fn invoke_tool_extracts_first_nonempty_text_block() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": {
                    "content": [{ "type": "text", "text": "42" }],
                    "_meta": { "downstream_api_calls": 2 }
                },
                "id": 1
            })))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let (text, meta) = client
            .invoke_tool(&server, "calc", json!({ "expr": "6*7" }), opts())
            .await
            .unwrap();
        assert_eq!(text, "42");
        assert_eq!(meta.unwrap().downstream_api_calls, Some(2));
    }

    #[tokio::test]
    async fn invoke_tool_falls_back_to_raw_content_when_no_text_block() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "result": { "content": [{ "type": "image", "data": "..." }] },
                "id": 1
            })))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let (text, _) = client.invoke_tool(&server, "x", json!({}), opts()).await.unwrap();
        assert!(text.contains("image"));
    }

    #[tokio::test]
    async fn discover_returns_error_string_on_failure_without_failing_the_call() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock)
            .await;

        let client = ToolServerClient::new();
        let server = server_config(mock.uri());
        let result = client.discover(&server, Duration::from_secs(1)).await;
        assert!(result.tools.is_empty());
        assert!(result.error.is_some());
    }

    #[test]
    fn extract_tool_result_text_prefers_text_block() {
        let value = json!({ "content": [{ "type": "text", "text": "" }, { "type": "text", "text": "hi" }] });
        assert_eq!(extract_tool_result_text(&value), "hi");
    }
}
