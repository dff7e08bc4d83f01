pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod session_actor;

pub use config::Config;
pub use dispatch::DispatchContext;
pub use error::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestrationOutcome};
pub use progress::{ChannelSink, NoopSink, ProgressEvent, ProgressFanout, ProgressSink, WebhookMode, WebhookRelay};
pub use session::{Exchange, Preferences, RateLimitWindow, SessionKey, SessionState};
pub use session_actor::{Cancel, EmptyToolServerSource, ProcessTurn, SessionActor, ToolServerSource, TurnOutcome};
