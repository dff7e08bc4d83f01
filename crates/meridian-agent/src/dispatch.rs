//! Per-tool-call dispatch chain (spec §4.7 "Per-tool-call dispatch"):
//! validate → catalog lookup → budget → health → invoke → record,
//! grounded in `crates/agent/src/agent/tool_execution.rs`'s
//! `execute_tool_call` shape (instrumented span, structured fields,
//! side-effect recording after the call completes).

use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_core::{Budget, CallOptions, Catalog, CoreError, HealthTracker, ToolServerClient};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::instrument;

/// Shared per-request state the dispatcher consults and updates. Owned
/// exclusively by one request's Orchestrator (spec §3 "Ownership").
pub struct DispatchContext {
    pub catalog: Arc<Catalog>,
    pub budget: Mutex<Budget>,
    pub health: Mutex<HealthTracker>,
    pub client: Arc<ToolServerClient>,
    pub max_response_bytes: u64,
    pub invocation_timeout: Duration,
}

impl DispatchContext {
    pub fn new(
        catalog: Arc<Catalog>,
        budget: Budget,
        health: HealthTracker,
        client: Arc<ToolServerClient>,
        max_response_bytes: u64,
        invocation_timeout: Duration,
    ) -> Self {
        DispatchContext {
            catalog,
            budget: Mutex::new(budget),
            health: Mutex::new(health),
            client,
            max_response_bytes,
            invocation_timeout,
        }
    }

    /// Executes the six-step dispatch chain from spec §4.7 for a single
    /// tool-use call.
    #[instrument(skip(self, arguments), fields(tool_name = %name))]
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value, CoreError> {
        if !arguments.is_object() && !arguments.is_null() {
            return Err(CoreError::Validation(format!(
                "arguments for tool {name} must be a JSON object"
            )));
        }

        let tool = self
            .catalog
            .find_tool(name)
            .ok_or_else(|| CoreError::UnknownTool { name: name.to_string() })?;

        {
            let budget = self.budget.lock().await;
            if budget.would_exceed() {
                let status = budget.status();
                return Err(CoreError::BudgetExceeded { used: status.total, limit: budget.limit });
            }
        }

        {
            let health = self.health.lock().await;
            if !health.is_healthy(&tool.server_id) {
                return Err(CoreError::ServerUnhealthy { server_id: tool.server_id.clone() });
            }
        }

        let server = self
            .catalog
            .server(&tool.server_id)
            .ok_or_else(|| CoreError::UnknownTool { name: name.to_string() })?;

        let started = Instant::now();
        let opts = CallOptions { timeout: self.invocation_timeout, max_response_bytes: self.max_response_bytes };
        let call_result = self.client.invoke_tool(server, &tool.remote_name, arguments, opts).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match call_result {
            Ok((text, meta)) => {
                self.health.lock().await.record_success(&tool.server_id, elapsed_ms, now_ms());
                let downstream_api_calls = meta.as_ref().and_then(|m| m.downstream_api_calls);
                self.budget.lock().await.record_call(Some(meridian_core::CallMeta { downstream_api_calls }));
                Ok(Value::String(text))
            }
            Err(error) => {
                self.health.lock().await.record_failure(&tool.server_id, error.to_string(), now_ms());
                self.budget.lock().await.record_call(None);
                Err(error)
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ServerConfig;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_with(server_url: String) -> Catalog {
        let server = ServerConfig {
            id: "s1".to_string(),
            name: "server one".to_string(),
            url: server_url,
            auth_token: None,
            enabled: true,
            priority: 0,
            allowed_tools: vec![],
        };
        let discoveries = vec![meridian_core::DiscoveryResult {
            server_id: "s1".to_string(),
            tools: vec![meridian_core::ToolManifestEntry {
                name: "search".to_string(),
                description: "search the web".to_string(),
                input_schema: serde_json::json!({}),
            }],
            error: None,
        }];
        Catalog::build(&[server], &discoveries)
    }

    #[tokio::test]
    async fn unknown_tool_fails_fast_without_a_network_call() {
        let ctx = DispatchContext::new(
            Arc::new(catalog_with("http://127.0.0.1:1".to_string())),
            Budget::new(120, 12),
            HealthTracker::new(),
            Arc::new(ToolServerClient::new()),
            1_048_576,
            Duration::from_secs(1),
        );
        let err = ctx.dispatch("does_not_exist", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn successful_call_updates_health_and_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"content": [{"type": "text", "text": "3 results"}]}
            })))
            .mount(&server)
            .await;

        let ctx = DispatchContext::new(
            Arc::new(catalog_with(server.uri())),
            Budget::new(120, 12),
            HealthTracker::new(),
            Arc::new(ToolServerClient::new()),
            1_048_576,
            Duration::from_secs(1),
        );
        let value = ctx.dispatch("search", serde_json::json!({"q": "rust"})).await.unwrap();
        assert_eq!(value, serde_json::json!("3 results"));

        let health = ctx.health.lock().await;
        assert!(health.is_healthy("s1"));
        let budget = ctx.budget.lock().await;
        assert!(!budget.exceeded());
        let _ = HashMap::<String, String>::new();
    }

    #[tokio::test]
    async fn budget_exhaustion_fails_before_any_call() {
        let mut budget = Budget::new(30, 10);
        budget.record_call(Some(meridian_core::CallMeta { downstream_api_calls: Some(25) }));
        let ctx = DispatchContext::new(
            Arc::new(catalog_with("http://127.0.0.1:1".to_string())),
            budget,
            HealthTracker::new(),
            Arc::new(ToolServerClient::new()),
            1_048_576,
            Duration::from_secs(1),
        );
        let err = ctx.dispatch("search", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn unhealthy_server_is_not_called() {
        let mut health = HealthTracker::new();
        for _ in 0..3 {
            health.record_failure("s1", "boom".to_string(), 0);
        }
        let ctx = DispatchContext::new(
            Arc::new(catalog_with("http://127.0.0.1:1".to_string())),
            Budget::new(120, 12),
            health,
            Arc::new(ToolServerClient::new()),
            1_048_576,
            Duration::from_secs(1),
        );
        let err = ctx.dispatch("search", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::ServerUnhealthy { .. }));
    }
}
