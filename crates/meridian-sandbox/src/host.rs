//! Adapts the orchestrator's tool dispatch into the sandbox's host-function
//! surface: one promise-returning function per catalog tool name, all
//! re-entering through a single async closure so the runtime can meter and
//! cap calls uniformly (spec §4.5: "a host function per tool").

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::types::{HostFn, HostFunctions};

/// Builds the `HostFunctions` table the runtime injects into a script's
/// global scope, from a list of tool names and a single dispatcher closure
/// shared by all of them. The dispatcher receives the tool name and the
/// script-supplied argument object.
pub fn build_host_functions<F, Fut>(tool_names: impl IntoIterator<Item = String>, dispatch: F) -> HostFunctions
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    let dispatch = Arc::new(dispatch);
    let mut functions = HostFunctions::new();
    for name in tool_names {
        let dispatch = dispatch.clone();
        let tool_name = name.clone();
        let f: HostFn = Arc::new(move |args: Value| {
            let dispatch = dispatch.clone();
            let tool_name = tool_name.clone();
            let fut: Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> =
                Box::pin(async move { dispatch(tool_name, args).await });
            fut
        });
        functions.insert(name, f);
    }
    functions
}
