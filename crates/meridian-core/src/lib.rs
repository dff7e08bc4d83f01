//! Domain model and leaf components of the meridian orchestration engine:
//! the LM message/tool data model, the Tool-Server Client, the Catalog
//! Builder, the Health Tracker, and the Call Budget (spec §3, §4.1-§4.4).

pub mod budget;
pub mod catalog;
pub mod chat;
pub mod error;
pub mod health;
pub mod tool_client;

pub use budget::{Budget, BudgetStatus, BudgetWarning, CallMeta};
pub use catalog::{Catalog, CatalogTool, DiscoveryResult, ServerConfig, ToolManifestEntry};
pub use chat::{
    ChatMessage, ChatRole, ChunkStream, ContentBlock, FinalMessage, InvokeRequest, LmTransport,
    ProgressSink, StopReason, StreamChunk, Tool, Usage,
};
pub use error::CoreError;
pub use health::{HealthTracker, ServerHealthSummary};
pub use tool_client::{CallOptions, CallOutcome, ResultMeta, ToolServerClient};
