//! Sandbox Runtime (spec §3, §4.5): a per-call embedded QuickJS interpreter
//! that evaluates a model-authored script with metered re-entry into a
//! fixed set of host functions.

pub mod host;
pub mod runtime;
pub mod types;

pub use host::build_host_functions;
pub use runtime::SandboxRuntime;
pub use types::{
    HostFn, HostFunctions, HostFuture, LogEntry, LogLevel, SandboxInvocation, SandboxOutcome,
    DEFAULT_INTERRUPT_STEP_CADENCE, MAX_SCRIPT_CHARS, REENTRY_WARNING_FRACTION,
};
