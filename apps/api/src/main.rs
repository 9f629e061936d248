use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use sandbox::db::DATABASE_URL_ENV;
use sandbox::fs::IgnoreSet;
use sandbox::run::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT};
use sandbox::{
    AgentConfig, ChatAgent, ChatMessage, ChatModel, DataAccess, DatabaseConfig, FsConfig,
    LlmConfig, OpenAiChatModel, ProjectRoot, RunConfig, SandboxFs, SandboxRun, ToolOutput,
    ToolRegistry, Toolbox, TARGET_ROOT_ENV,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, dispatcher, error, info, info_span, warn, Instrument};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

const MAX_LOGGED_BODY_BYTES: usize = 2 * 1024 * 1024;

struct AppMetrics {
    registry: Registry,
    chat_requests: IntCounterVec,
    chat_duration: Histogram,
    tool_invocations: IntCounterVec,
}

impl AppMetrics {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let chat_requests = IntCounterVec::new(
            Opts::new("chat_requests_total", "Chat requests handled, by outcome"),
            &["status"],
        )?;
        let chat_duration = Histogram::with_opts(HistogramOpts::new(
            "chat_request_duration_seconds",
            "Time spent answering a chat request in seconds",
        ))?;
        let tool_invocations = IntCounterVec::new(
            Opts::new(
                "tool_invocations_total",
                "Tool calls executed on behalf of the agent",
            ),
            &["tool", "status"],
        )?;
        registry.register(Box::new(chat_requests.clone()))?;
        registry.register(Box::new(chat_duration.clone()))?;
        registry.register(Box::new(tool_invocations.clone()))?;
        Ok(Self {
            registry,
            chat_requests,
            chat_duration,
            tool_invocations,
        })
    }

    fn record_chat(&self, status: &str, duration: Duration) {
        self.chat_requests.with_label_values(&[status]).inc();
        self.chat_duration.observe(duration.as_secs_f64());
    }

    fn record_tool(&self, output: &ToolOutput) {
        let status = if output.is_error { "error" } else { "success" };
        self.tool_invocations
            .with_label_values(&[output.tool.as_str(), status])
            .inc();
    }

    fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct AppState {
    agent: Arc<ChatAgent>,
    metrics: Arc<AppMetrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err.into());
        }
    }
    init_tracing()?;

    let metrics = Arc::new(AppMetrics::new()?);
    let toolbox = initialize_toolbox().await?;
    let registry = Arc::new(ToolRegistry::new(Arc::new(toolbox)));
    info!(tools = ?registry.names(), "tool registry ready");

    let model = OpenAiChatModel::new(llm_config())?;
    let state = build_state(Arc::new(model), registry, agent_config(), metrics);

    let cors = cors_layer(&env_string("CLIENT_ORIGIN", "http://localhost:3000"))?;
    let app = build_router(state, cors);

    let host = env_string("SERVER_HOST", "localhost");
    let port = env_parse("SERVER_PORT", 8000_u16);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!(addr = %listener.local_addr()?, "server starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

fn build_state(
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
    metrics: Arc<AppMetrics>,
) -> AppState {
    let recorder = Arc::clone(&metrics);
    let agent = ChatAgent::new(model, registry, config)
        .with_tool_observer(Arc::new(move |output: &ToolOutput| recorder.record_tool(output)));
    AppState {
        agent: Arc::new(agent),
        metrics,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().json();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/chat", post(chat))
        .with_state(state)
        .layer(middleware::from_fn(log_bodies))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    Ok(CorsLayer::new()
        .allow_origin(origin.parse::<HeaderValue>()?)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
}

async fn initialize_toolbox() -> anyhow::Result<Toolbox> {
    let root = project_root()?;

    let mut fs_config = FsConfig::new(root.clone());
    if let Some(names) = env_list("TOOL_LIST_IGNORE") {
        fs_config = fs_config.with_listing_ignore(IgnoreSet::new(names));
    }
    if let Some(names) = env_list("TOOL_FIND_IGNORE") {
        fs_config = fs_config.with_search_ignore(IgnoreSet::new(names));
    }

    let timeout_secs = env_parse("TOOL_RUN_TIMEOUT_SECS", DEFAULT_TIMEOUT.as_secs());
    let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
    let max_output = env_parse("TOOL_RUN_MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES);
    let run_config = RunConfig::new(root, timeout, max_output)?;

    let data = DataAccess::from_config(database_config()).await;
    Ok(Toolbox::new(
        SandboxFs::new(fs_config),
        SandboxRun::new(run_config),
        data,
    ))
}

/// The configured project root, or the working directory when none is set.
///
/// A root that cannot be opened leaves the tools unconfigured instead of
/// aborting startup; every tool call then reports the missing setting.
fn project_root() -> anyhow::Result<ProjectRoot> {
    let cwd = std::env::current_dir()?;
    let path = match std::env::var(TARGET_ROOT_ENV) {
        Ok(raw) if !raw.trim().is_empty() => {
            let path = PathBuf::from(raw.trim());
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        }
        _ => cwd,
    };
    match ProjectRoot::new(&path) {
        Ok(root) => {
            info!(root = %path.display(), "project root configured");
            Ok(root)
        }
        Err(err) => {
            warn!(root = %path.display(), %err, "project root unusable, tools disabled");
            Ok(ProjectRoot::unset())
        }
    }
}

fn database_config() -> Option<DatabaseConfig> {
    let url = std::env::var(DATABASE_URL_ENV)
        .ok()
        .filter(|url| !url.trim().is_empty())?;
    Some(
        DatabaseConfig::new(url)
            .with_max_connections(env_parse("DATABASE_MAX_CONNECTIONS", 5))
            .with_sample_rows(env_parse("DATABASE_SAMPLE_ROWS", 3))
            .with_read_only(env_parse("DATABASE_READ_ONLY", false)),
    )
}

fn llm_config() -> LlmConfig {
    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.is_empty());
    if api_key.is_none() {
        warn!("OPENAI_API_KEY not set, model requests are sent without credentials");
    }
    LlmConfig::new(
        env_string("LLM_BASE_URL", "https://api.openai.com"),
        env_string("LLM_MODEL", "gpt-4o"),
    )
    .with_api_key(api_key)
    .with_timeout(Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 120)))
}

fn agent_config() -> AgentConfig {
    let defaults = AgentConfig::default();
    let max_iterations = env_parse("AGENT_MAX_ITERATIONS", defaults.max_iterations);
    defaults.with_max_iterations(max_iterations)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|value| {
        value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
    })
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            )
                .into_response()
        }
    }
}

async fn log_bodies(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_LOGGED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "failed to buffer request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };
    debug!(
        method = %parts.method,
        uri = %parts.uri,
        body = %String::from_utf8_lossy(&bytes),
        "request received"
    );
    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    debug!(status = %response.status(), "response sent");
    response
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(rename = "conversationHistory", default)]
    conversation_history: Vec<HistoryMessage>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
}

async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);
    async move {
        let start = Instant::now();
        let history = to_history(req.conversation_history);
        info!(history = history.len(), "chat request");

        match state.agent.respond(history, &req.message).await {
            Ok(reply) => {
                state.metrics.record_chat("ok", start.elapsed());
                info!(tool_calls = reply.tool_calls.len(), "chat answered");
                (
                    StatusCode::OK,
                    Json(ChatResponse {
                        response: reply.response,
                    }),
                )
                    .into_response()
            }
            Err(err) => {
                state.metrics.record_chat("error", start.elapsed());
                error!(%err, "chat request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
    .instrument(span)
    .await
}

fn to_history(messages: Vec<HistoryMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter_map(|message| match message.role.as_str() {
            "user" => Some(ChatMessage::user(message.content)),
            "assistant" => Some(ChatMessage::assistant(message.content)),
            _ => None,
        })
        .collect()
}
