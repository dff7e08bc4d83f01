//! Thin HTTP binary wiring the orchestration core to the client-facing
//! interface from SPEC_FULL §6. Everything in this binary is out of scope
//! for the core per SPEC_FULL §1; it exists to make the core runnable.
//! Grounded in `crates/service/src/main.rs` (Args/ServerState/handle_chat
//! unary-vs-SSE routing).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use futures::StreamExt;
use kameo::actor::{ActorRef, Spawn};
use tokio_stream::wrappers::UnboundedReceiverStream;
use meridian_agent::{
    AgentError, ChannelSink, Config, EmptyToolServerSource, Orchestrator, ProcessTurn,
    ProgressEvent, ProgressFanout, SessionActor, SessionKey, WebhookMode, WebhookRelay,
};
use meridian_anthropic::AnthropicTransport;
use meridian_core::ToolServerClient;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    #[arg(long)]
    auth_key: Option<String>,
}

/// System-prompt text shared across sessions; not part of the spec's
/// testable surface, so it lives as a plain constant rather than a
/// configuration knob.
const SYSTEM_PROMPT: &str = "You are a helpful assistant. Use execute_code to call tools.";

struct SessionRegistry {
    sessions: Mutex<HashMap<String, ActorRef<SessionActor>>>,
}

impl SessionRegistry {
    fn new() -> Self {
        SessionRegistry { sessions: Mutex::new(HashMap::new()) }
    }

    async fn get_or_spawn(&self, key: &SessionKey, state: &ServerState) -> ActorRef<SessionActor> {
        let actor_key = key.as_actor_key();
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&actor_key) {
            return existing.clone();
        }
        let actor = SessionActor::new(
            key.clone(),
            state.config.clone(),
            state.orchestrator.clone(),
            Arc::new(EmptyToolServerSource),
            state.tool_client.clone(),
            SYSTEM_PROMPT.to_string(),
        );
        let actor_ref = SessionActor::spawn(actor);
        sessions.insert(actor_key, actor_ref.clone());
        actor_ref
    }
}

#[derive(Clone)]
struct ServerState {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    tool_client: Arc<ToolServerClient>,
    registry: Arc<SessionRegistry>,
    auth_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatRequest {
    client_id: String,
    user_id: String,
    message: String,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    progress_callback_url: Option<String>,
    #[serde(default)]
    progress_throttle_seconds: Option<f64>,
    #[serde(default)]
    progress_mode: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    responses: Vec<String>,
    response_language: String,
    voice_audio_base64: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meridian_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let config = Arc::new(Config::from_env());

    let anthropic_config = meridian_anthropic::AnthropicConfig::from_env().map_err(anyhow::Error::msg)?;
    let transport: Arc<dyn meridian_core::LmTransport> = Arc::new(AnthropicTransport::new(anthropic_config));
    let orchestrator = Arc::new(Orchestrator::new(transport, meridian_sandbox::SandboxRuntime::new()));

    info!(addr = %args.addr, auth = %args.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"), "starting meridian-service");

    let state = ServerState {
        config,
        orchestrator,
        tool_client: Arc::new(ToolServerClient::new()),
        registry: Arc::new(SessionRegistry::new()),
        auth_key: args.auth_key,
    };

    let app = Router::new()
        .route("/v1/messages", post(handle_message))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_message(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, (StatusCode, Json<ErrorBody>)> {
    if let Some(key) = &state.auth_key {
        let presented = headers
            .get("Authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(key.as_str()) {
            warn!("unauthorized request");
            return Err((StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "invalid or missing API key".to_string() })));
        }
    }

    if req.client_id.trim().is_empty() {
        return Err(bad_request(AgentError::EmptyClientId));
    }
    if req.message.trim().is_empty() {
        return Err(bad_request(AgentError::EmptyMessage));
    }

    let org = req.org.clone().unwrap_or_else(|| state.config.default_org.clone());
    let session_key = SessionKey::new(org, req.user_id.clone());
    let actor_ref = state.registry.get_or_spawn(&session_key, &state).await;

    let wants_stream = req.progress_callback_url.is_none() && req.progress_mode.is_some();
    let _ = req.message_type;

    let webhook = req.progress_callback_url.as_ref().map(|url| {
        let mode = webhook_mode(req.progress_mode.as_deref(), req.progress_throttle_seconds);
        Arc::new(WebhookRelay::new(url.clone(), mode))
    });

    if wants_stream {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink::new(tx));
        let mut progress = ProgressFanout::new(sink);
        if let Some(webhook) = webhook.clone() {
            progress = progress.with_webhook(webhook);
        }

        let turn = ProcessTurn { client_id: req.client_id.clone(), user_message: req.message.clone(), progress };
        let client_id = req.client_id.clone();
        if let Err(error) = actor_ref.tell(turn).await {
            warn!(%error, client_id = %client_id, "session actor tell failed");
        }

        let event_stream = UnboundedReceiverStream::new(rx)
            .scan(false, |done, event| {
                if *done {
                    return futures::future::ready(None);
                }
                if matches!(event, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }) {
                    *done = true;
                }
                let data = serde_json::to_string(&event).unwrap_or_default();
                futures::future::ready(Some(Ok::<Event, Infallible>(Event::default().data(data))))
            });

        let response = Sse::new(event_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"));
        return Ok(response.into_response());
    }

    let mut progress = ProgressFanout::new(Arc::new(meridian_agent::NoopSink));
    if let Some(webhook) = webhook {
        progress = progress.with_webhook(webhook);
    }
    let turn = ProcessTurn { client_id: req.client_id.clone(), user_message: req.message.clone(), progress };

    match actor_ref.ask(turn).await {
        Ok(Ok(outcome)) => Ok(Json(ChatResponse {
            responses: outcome.responses,
            response_language: outcome.response_language,
            voice_audio_base64: None,
        })
        .into_response()),
        Ok(Err(agent_error)) => Err(bad_request(agent_error)),
        Err(error) => {
            error!(%error, "session actor unreachable");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody { error: "session actor unreachable".to_string() }),
            ))
        }
    }
}

fn bad_request(error: AgentError) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: error.to_string() }))
}

/// Maps the client's `progress_mode` string to a `WebhookMode` (spec §4.9,
/// §6). Unrecognized or absent modes fall back to `complete`, the mode with
/// the simplest client-side contract.
fn webhook_mode(progress_mode: Option<&str>, throttle_seconds: Option<f64>) -> WebhookMode {
    match progress_mode {
        Some("iteration") => WebhookMode::Iteration,
        Some("periodic") => WebhookMode::periodic(throttle_seconds.unwrap_or(1.0)),
        Some("sentence") => WebhookMode::Sentence,
        _ => WebhookMode::Complete,
    }
}
