//! Sandbox data model (spec §3, §4.5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use meridian_core::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_SCRIPT_CHARS: usize = 100_000;

/// Interpreter-step cadence at which the wall-clock timeout is polled
/// (spec §4.5 step 4, default C = 10,000).
pub const DEFAULT_INTERRUPT_STEP_CADENCE: u64 = 10_000;

/// Warn once re-entries reach this fraction of `max_reentries` (spec §4.5
/// "Logging").
pub const REENTRY_WARNING_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp_ms: u64,
}

/// One sandbox invocation (spec §3 "Sandbox invocation").
#[derive(Debug, Clone)]
pub struct SandboxInvocation {
    pub script: String,
    pub timeout_ms: u64,
    pub max_reentries: u32,
    /// Optional cap on the total bytes of rendered log message text; once
    /// exceeded, a single truncation warning is appended and further log
    /// calls are dropped. `None` means unbounded (the spec does not mandate
    /// a default; this enriches the ambient console surface the way the
    /// reference sandbox crate's logging tests exercise it).
    pub max_log_bytes: Option<usize>,
}

impl SandboxInvocation {
    pub fn new(script: impl Into<String>, timeout_ms: u64, max_reentries: u32) -> Self {
        SandboxInvocation {
            script: script.into(),
            timeout_ms,
            max_reentries,
            max_log_bytes: None,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.script.is_empty() {
            return Err(CoreError::InvalidScript {
                reason: "script is empty".to_string(),
            });
        }
        if self.script.len() > MAX_SCRIPT_CHARS {
            return Err(CoreError::InvalidScript {
                reason: format!(
                    "script exceeds {MAX_SCRIPT_CHARS} characters (got {})",
                    self.script.len()
                ),
            });
        }
        Ok(())
    }
}

/// Outcome of a sandbox run (spec §3).
#[derive(Debug, Clone)]
pub enum SandboxOutcome {
    Success {
        value: Value,
        logs: Vec<LogEntry>,
        duration_ms: u64,
        reentries_made: u32,
    },
    Failure {
        error: CoreError,
        logs: Vec<LogEntry>,
        duration_ms: u64,
        reentries_made: u32,
    },
}

impl SandboxOutcome {
    pub fn logs(&self) -> &[LogEntry] {
        match self {
            SandboxOutcome::Success { logs, .. } => logs,
            SandboxOutcome::Failure { logs, .. } => logs,
        }
    }

    pub fn reentries_made(&self) -> u32 {
        match self {
            SandboxOutcome::Success { reentries_made, .. } => *reentries_made,
            SandboxOutcome::Failure { reentries_made, .. } => *reentries_made,
        }
    }
}

pub type HostFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// One host function reachable from the script, keyed by catalog tool name
/// (spec §4.5: "one function per host-function name").
pub type HostFn = Arc<dyn Fn(Value) -> HostFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct HostFunctions(pub std::collections::HashMap<String, HostFn>);

impl HostFunctions {
    pub fn new() -> Self {
        HostFunctions::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, f: HostFn) {
        self.0.insert(name.into(), f);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
