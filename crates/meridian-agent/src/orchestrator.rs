//! The bounded LM↔tool loop (spec §4.7), grounded in the teacher's
//! `execute_tool_call`/`tool_execution` span-and-dispatch shape
//! (`crates/agent/src/agent/tool_execution.rs`) and its
//! `middleware/limits.rs` iteration-budget idiom, generalized to this
//! engine's meta-tool-only surface.

use std::sync::Arc;

use futures::future::join_all;
use meridian_core::{
    BudgetStatus, ChatMessage, ChatRole, ContentBlock, CoreError, FinalMessage, HealthTracker, InvokeRequest,
    LmTransport, ServerHealthSummary, StopReason, StreamChunk, Tool,
};
use meridian_sandbox::{build_host_functions, HostFunctions, SandboxInvocation, SandboxOutcome, SandboxRuntime};
use serde_json::{json, Value};
use tracing::instrument;

use crate::dispatch::DispatchContext;
use crate::progress::ProgressFanout;

pub const EXECUTE_CODE_TOOL: &str = "execute_code";
pub const GET_TOOL_DEFINITIONS_TOOL: &str = "get_tool_definitions";

/// The only tools the LM directly sees (spec §4.7 "Meta-tools exposed to
/// the LM"). Catalog tools are reached only from inside `execute_code`.
pub fn meta_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: EXECUTE_CODE_TOOL.to_string(),
            description: "Run JavaScript that may call any catalog tool as an async function by name. \
                Returns {result, logs, duration_ms} on success or {error, logs} on failure."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "code": { "type": "string" } },
                "required": ["code"]
            }),
        },
        Tool {
            name: GET_TOOL_DEFINITIONS_TOOL.to_string(),
            description: "Fetch the input_schema for one or more catalog tool names.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_names": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["tool_names"]
            }),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub code_exec_timeout_ms: u64,
    pub max_reentries: u32,
}

pub struct OrchestrationOutcome {
    pub responses: Vec<String>,
    pub budget_status: BudgetStatus,
    pub health_summary: std::collections::HashMap<String, ServerHealthSummary>,
}

pub struct Orchestrator {
    lm: Arc<dyn LmTransport>,
    sandbox: SandboxRuntime,
}

impl Orchestrator {
    pub fn new(lm: Arc<dyn LmTransport>, sandbox: SandboxRuntime) -> Self {
        Orchestrator { lm, sandbox }
    }

    #[instrument(skip(self, history, dispatch, config, progress), fields(max_iterations = config.max_iterations))]
    pub async fn run(
        &self,
        system_prompt: &str,
        history: Vec<ChatMessage>,
        user_message: &str,
        dispatch: Arc<DispatchContext>,
        config: &OrchestratorConfig,
        progress: &ProgressFanout,
    ) -> Result<OrchestrationOutcome, CoreError> {
        let mut messages = history;
        messages.push(ChatMessage::user_text(user_message));
        let tools = meta_tools();
        let mut responses = Vec::new();

        for iteration in 0..config.max_iterations {
            if iteration > 0 {
                progress.sink.on_progress("\u{2014}");
            }

            let request = InvokeRequest {
                model: &config.model,
                max_tokens: config.max_tokens,
                system: system_prompt,
                messages: &messages,
                tools: &tools,
            };

            let sink = progress.sink.clone();
            let on_progress = move |chunk: StreamChunk| {
                if let StreamChunk::TextDelta { text } = chunk {
                    sink.on_progress(&text);
                }
            };
            let final_message: FinalMessage = self.lm.invoke_streaming(request, &on_progress).await?;

            let text = final_message.text_content();
            if !text.is_empty() {
                responses.push(text.clone());
                progress.sink.on_iteration_complete(&text);
                if let Some(webhook) = &progress.webhook {
                    webhook.on_text(&text, true).await;
                }
            }

            let tool_use_blocks: Vec<ContentBlock> = final_message
                .content
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .cloned()
                .collect();

            let no_more_tools = matches!(final_message.stop_reason, StopReason::EndTurn) || tool_use_blocks.is_empty();
            if no_more_tools {
                break;
            }

            progress
                .sink
                .on_status(&format!("Executing {} tool(s)\u{2026}", tool_use_blocks.len()));

            let dispatch = dispatch.clone();
            let config = config.clone();
            let results = join_all(tool_use_blocks.iter().map(|block| {
                let dispatch = dispatch.clone();
                let config = config.clone();
                let progress = progress;
                async move { execute_meta_tool_call(block, &dispatch, &config, progress).await }
            }))
            .await;

            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: final_message.content.clone(),
            });
            messages.push(ChatMessage::user_tool_results(results));
        }

        let budget_status = dispatch.budget.lock().await.status();
        let health_summary = dispatch.health.lock().await.summary();
        tracing::info!(
            mcp_calls = ?budget_status.total,
            budget_warning = ?budget_status.warning,
            "orchestration complete"
        );

        Ok(OrchestrationOutcome { responses, budget_status, health_summary })
    }
}

/// Executes one tool-use block against the meta-tool surface, producing
/// its `tool_result` block (spec §4.7).
async fn execute_meta_tool_call(
    block: &ContentBlock,
    dispatch: &Arc<DispatchContext>,
    config: &OrchestratorConfig,
    progress: &ProgressFanout,
) -> ContentBlock {
    let ContentBlock::ToolUse { id, name, input } = block else {
        unreachable!("filtered to ToolUse blocks");
    };
    progress.sink.on_tool_use(name, input);

    let (content, is_error) = match name.as_str() {
        EXECUTE_CODE_TOOL => run_execute_code(input, dispatch, config).await,
        GET_TOOL_DEFINITIONS_TOOL => run_get_tool_definitions(input, dispatch),
        other => (
            json!({ "error": format!("unknown meta-tool: {other}") }).to_string(),
            true,
        ),
    };

    let result_value: Value = serde_json::from_str(&content).unwrap_or(Value::String(content.clone()));
    progress.sink.on_tool_result(name, &result_value);

    ContentBlock::ToolResult { tool_use_id: id.clone(), content, is_error }
}

async fn run_execute_code(input: &Value, dispatch: &Arc<DispatchContext>, config: &OrchestratorConfig) -> (String, bool) {
    let Some(code) = input.get("code").and_then(Value::as_str) else {
        return (json!({ "error": "execute_code requires a string \"code\" field" }).to_string(), true);
    };

    let tool_names: Vec<String> = dispatch.catalog.tool_names().into_iter().map(str::to_string).collect();
    let dispatch_for_host = dispatch.clone();
    let host_functions: HostFunctions = build_host_functions(tool_names, move |name, args| {
        let dispatch = dispatch_for_host.clone();
        async move { dispatch.dispatch(&name, args).await.map_err(|e| e.to_string()) }
    });

    let invocation = SandboxInvocation::new(code, config.code_exec_timeout_ms, config.max_reentries);
    match dispatch_run_sandbox(&invocation, host_functions).await {
        SandboxOutcome::Success { value, logs, duration_ms, .. } => (
            json!({
                "result": value,
                "logs": logs,
                "duration_ms": duration_ms,
            })
            .to_string(),
            false,
        ),
        SandboxOutcome::Failure { error, logs, reentries_made, .. } => {
            let mut payload = json!({ "error": error.to_string(), "logs": logs });
            if let CoreError::CallLimitExceeded { made, limit } = &error {
                payload["error_code"] = json!("CALL_LIMIT_EXCEEDED");
                payload["calls_made"] = json!(made);
                payload["limit"] = json!(limit);
                payload["suggestion"] =
                    json!("Reduce the number of tool calls made in one execute_code invocation, or split the work across iterations.");
            }
            let _ = reentries_made;
            (payload.to_string(), true)
        }
    }
}

/// Thin indirection so the sandbox is invoked through a dedicated runtime
/// instance rather than sharing one across concurrent calls, matching how
/// `SandboxRuntime` is designed to be cheap to construct per run.
async fn dispatch_run_sandbox(invocation: &SandboxInvocation, host_functions: HostFunctions) -> SandboxOutcome {
    SandboxRuntime::new().run(invocation.clone(), host_functions).await
}

fn run_get_tool_definitions(input: &Value, dispatch: &Arc<DispatchContext>) -> (String, bool) {
    let Some(names) = input.get("tool_names").and_then(Value::as_array) else {
        return (json!({ "error": "get_tool_definitions requires a \"tool_names\" array" }).to_string(), true);
    };
    let names: Vec<String> = names.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    let defs = dispatch.catalog.tool_definitions(&names);
    (json!(defs).to_string(), false)
}
