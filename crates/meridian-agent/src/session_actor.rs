//! Per-session actor (spec §4.8): one actor per `(organization, user)` key,
//! serializing requests FIFO and owning that key's history/preferences.
//! Grounded in `crates/agent/src/agent/session_actor.rs`'s
//! `SessionActor`/`TurnState` shape.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use kameo::message::{Context, Message};
use kameo::reply::DelegatedReply;
use kameo::Actor;
use meridian_core::{Budget, Catalog, DiscoveryResult, HealthTracker, ServerConfig, ToolServerClient};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::DispatchContext;
use crate::error::AgentError;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::progress::ProgressFanout;
use crate::session::{Exchange, SessionKey, SessionState};

/// Loads a (possibly empty, on error) ordered tool-server set for an
/// organization. The backing store is an external collaborator (spec §1
/// "out of scope"); this trait is the seam the Session Actor calls through.
#[async_trait]
pub trait ToolServerSource: Send + Sync {
    async fn load(&self, organization: &str) -> Vec<ServerConfig>;
}

/// A source with no configured servers, useful for tests and for
/// organizations that haven't registered any tool servers yet.
pub struct EmptyToolServerSource;

#[async_trait]
impl ToolServerSource for EmptyToolServerSource {
    async fn load(&self, _organization: &str) -> Vec<ServerConfig> {
        Vec::new()
    }
}

#[derive(Clone)]
pub(crate) struct TurnState {
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
}

impl TurnState {
    fn new() -> Self {
        TurnState { generation: 0, token: CancellationToken::new() }
    }
}

/// Per-(organization, user) actor. Owns session state exclusively; kameo's
/// mailbox gives the FIFO-per-key serialization spec §4.8 requires.
#[derive(Actor)]
pub struct SessionActor {
    key: SessionKey,
    state: SessionState,
    turn_state: TurnState,
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    tool_server_source: Arc<dyn ToolServerSource>,
    tool_client: Arc<ToolServerClient>,
    system_prompt_template: String,
}

pub struct ProcessTurn {
    pub client_id: String,
    pub user_message: String,
    pub progress: ProgressFanout,
}

pub struct TurnOutcome {
    pub responses: Vec<String>,
    pub response_language: String,
}

pub struct Cancel;

/// Sent by a detached turn task back to its own actor once the orchestrator
/// run (and cancellation race) resolves, so history can be persisted and
/// `first_interaction` cleared from inside the actor's single-writer
/// mailbox. Mirrors the teacher's `PromptFinished` (`crates/agent/src/
/// agent/session_actor.rs`): a stale `generation` (superseded by a newer
/// `ProcessTurn` or a `Cancel` that advanced the turn) is ignored.
pub struct TurnFinished {
    generation: u64,
    exchange: Option<Exchange>,
}

impl SessionActor {
    pub fn new(
        key: SessionKey,
        config: Arc<Config>,
        orchestrator: Arc<Orchestrator>,
        tool_server_source: Arc<dyn ToolServerSource>,
        tool_client: Arc<ToolServerClient>,
        system_prompt_template: String,
    ) -> Self {
        let history_capacity = config.history_capacity;
        SessionActor {
            key,
            state: SessionState::new(history_capacity),
            turn_state: TurnState::new(),
            config,
            orchestrator,
            tool_server_source,
            tool_client,
            system_prompt_template,
        }
    }
}

/// Discovers tools across the enabled servers of an organization (spec
/// §4.2). Free function rather than a `&self` method because it runs
/// inside a turn's detached task, after the actor's mailbox handler has
/// already returned.
async fn build_catalog(
    tool_server_source: &Arc<dyn ToolServerSource>,
    tool_client: &Arc<ToolServerClient>,
    organization: &str,
    discovery_timeout_ms: u64,
) -> Catalog {
    let servers = tool_server_source.load(organization).await;
    let enabled: Vec<ServerConfig> = servers.into_iter().filter(|s| s.enabled).collect();

    let discovery_timeout = Duration::from_millis(discovery_timeout_ms);
    let discoveries: Vec<DiscoveryResult> = futures::future::join_all(enabled.iter().map(|server| {
        let client = tool_client.clone();
        async move {
            let result = client.discover(server, discovery_timeout).await;
            if let Some(error) = &result.error {
                tracing::warn!(server_id = %server.id, %error, "tool discovery failed");
            }
            result
        }
    }))
    .await;

    Catalog::build(&enabled, &discoveries)
}

impl Message<ProcessTurn> for SessionActor {
    type Reply = DelegatedReply<Result<TurnOutcome, AgentError>>;

    /// Runs the turn in a detached task via `ctx.spawn` (mirroring the
    /// teacher's `Prompt` handler) so the mailbox returns immediately and
    /// stays responsive to `Cancel` while the orchestrator is running.
    /// Without this, `Cancel` is an ordinary message to the same actor and
    /// kameo's one-message-at-a-time mailbox can't deliver it — and thus
    /// can't cancel the token `tokio::select!` races against — until the
    /// in-flight turn has already finished on its own.
    async fn handle(&mut self, msg: ProcessTurn, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let trimmed = msg.user_message.trim().to_string();
        if msg.client_id.trim().is_empty() {
            let sink = msg.progress.sink.clone();
            return ctx.spawn(async move {
                sink.on_error(&AgentError::EmptyClientId.to_string());
                Err(AgentError::EmptyClientId)
            });
        }
        if trimmed.is_empty() {
            let sink = msg.progress.sink.clone();
            return ctx.spawn(async move {
                sink.on_error(&AgentError::EmptyMessage.to_string());
                Err(AgentError::EmptyMessage)
            });
        }

        self.turn_state.generation += 1;
        self.turn_state.token = CancellationToken::new();
        let token = self.turn_state.token.clone();
        let generation = self.turn_state.generation;

        let config = self.config.clone();
        let orchestrator = self.orchestrator.clone();
        let tool_server_source = self.tool_server_source.clone();
        let tool_client = self.tool_client.clone();
        let organization = self.key.organization.clone();
        let system_prompt_template = self.system_prompt_template.clone();
        let history_tail = self.state.history_tail_as_messages(self.config.history_llm_capacity);
        let response_language = self.state.preferences.response_language.clone();
        let actor_ref = ctx.actor_ref().clone();

        ctx.spawn(async move {
            let catalog = Arc::new(
                build_catalog(&tool_server_source, &tool_client, &organization, config.discovery_timeout_ms).await,
            );
            let dispatch = Arc::new(DispatchContext::new(
                catalog.clone(),
                Budget::new(config.max_downstream_calls_per_request, config.default_downstream_per_mcp_call),
                HealthTracker::new(),
                tool_client.clone(),
                config.max_mcp_response_size_bytes,
                Duration::from_millis(config.invocation_timeout_ms),
            ));

            let orchestrator_config = OrchestratorConfig {
                model: config.claude_model.clone(),
                max_tokens: config.claude_max_tokens,
                max_iterations: config.max_orchestration_iterations,
                code_exec_timeout_ms: config.code_exec_timeout_ms,
                max_reentries: config.max_mcp_calls_per_execution,
            };

            let system_prompt =
                format!("{}\n\nAvailable tools:\n{}", system_prompt_template, catalog.render_catalog_summary());

            let run_future =
                orchestrator.run(&system_prompt, history_tail, &trimmed, dispatch, &orchestrator_config, &msg.progress);

            let outcome = tokio::select! {
                result = run_future => result.map_err(AgentError::from),
                _ = token.cancelled() => Err(AgentError::Cancelled),
            };

            match outcome {
                Ok(outcome) => {
                    let assistant_text = outcome.responses.join("\n");

                    // Event-stream requests terminate on exactly one of
                    // `complete`/`error` (spec §4.8, §8); the in-process sink
                    // and the webhook relay both fire here so neither
                    // delivery mode is left hanging.
                    msg.progress.sink.on_complete(&assistant_text);
                    if let Some(webhook) = &msg.progress.webhook {
                        webhook.on_complete(&assistant_text).await;
                    }

                    let exchange = Exchange {
                        user_message: trimmed.clone(),
                        assistant_text: assistant_text.clone(),
                        timestamp_ms: now_ms(),
                    };
                    if let Err(error) = actor_ref.tell(TurnFinished { generation, exchange: Some(exchange) }).await {
                        tracing::warn!(%error, "failed to deliver TurnFinished to session actor");
                    }

                    Ok(TurnOutcome { responses: outcome.responses, response_language })
                }
                Err(error) => {
                    msg.progress.sink.on_error(&error.to_string());
                    if let Err(tell_error) = actor_ref.tell(TurnFinished { generation, exchange: None }).await {
                        tracing::warn!(error = %tell_error, "failed to deliver TurnFinished to session actor");
                    }
                    Err(error)
                }
            }
        })
    }
}

impl Message<Cancel> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, _msg: Cancel, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.turn_state.token.cancel();
    }
}

impl Message<TurnFinished> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: TurnFinished, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if msg.generation != self.turn_state.generation {
            return;
        }
        if let Some(exchange) = msg.exchange {
            self.state.push_exchange(exchange);
            self.state.preferences.first_interaction = false;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
