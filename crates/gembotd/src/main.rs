use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use gembot_core::config::{AppConfig, BotConfig};
use gembot_core::types::{ApiResponse, HealthResponse, InboundMessage, OutboundReply};
use tracing::{error, info, warn};
use uuid::Uuid;

mod dispatcher;
mod image_context;
mod intent_router;
mod llm_gateway;
mod orchestrator;
mod segment_tool;
mod session_store;
mod strategy;

use dispatcher::{DispatchError, DispatchHandle, Dispatcher};
use image_context::ImageContextCache;
use llm_gateway::{GeminiClient, LlmBackend};
use orchestrator::Orchestrator;
use segment_tool::{ImageSegmenter, SegmentationTool};
use session_store::{JsonFileStorage, SessionStore};

const LOG_PREVIEW_MAX_CHARS: usize = 2000;
const BUILTIN_SYSTEM_PROMPT: &str = include_str!("../../../prompts/system_prompt.md");

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    dispatch: DispatchHandle,
    sessions: Arc<SessionStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // 默认用 info 级别，若设置 RUST_LOG 则以环境变量为准。
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(false)
        .compact()
        .init();

    let config = AppConfig::load("configs/config.toml")?;
    let workspace_root = std::env::current_dir()?;
    let system_prompt = load_system_prompt(&workspace_root, &config.bot);

    let backend: Arc<dyn LlmBackend> =
        Arc::new(GeminiClient::from_config(&config, &workspace_root)?);
    info!(
        "llm backend ready: base_url={} model={} router_model={} segmentation_model={} google_search={}",
        config.llm.endpoint_base(),
        config.llm.model,
        config.llm.router_model(),
        config.llm.segmentation_model(),
        config.llm.enable_google_search
    );

    let history_path =
        resolve_path(&workspace_root, &config.history.dir).join(&config.history.file_name);
    info!("history record: {}", history_path.display());
    let sessions = Arc::new(SessionStore::new(Arc::new(JsonFileStorage::new(history_path))));
    let images = Arc::new(ImageContextCache::new(config.image.context_ttl_seconds));
    let output_dir = resolve_path(&workspace_root, &config.image.output_dir);
    info!(
        "segmentation output_dir={} image_ttl_seconds={}",
        output_dir.display(),
        config.image.context_ttl_seconds
    );
    let tool: Arc<dyn SegmentationTool> = Arc::new(ImageSegmenter::new(
        backend.clone(),
        images.clone(),
        config.llm.segmentation_model(),
        output_dir,
        config.image.max_upload_dimension,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        backend,
        tool,
        sessions.clone(),
        images.clone(),
        system_prompt,
    ));
    let dispatcher = Arc::new(Dispatcher::new(orchestrator, images, config.bot.clone()));

    let (dispatch, rx) = dispatcher::channel(config.server.queue_limit);
    let consumer = dispatcher::spawn_consumer(dispatcher, rx);

    let state = AppState {
        started_at: Instant::now(),
        dispatch,
        sessions,
    };
    let app = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/messages", post(submit_message))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!("gembotd listening on {}", config.server.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and its queue handle) is gone now, so the consumer drains and exits.
    if let Err(err) = consumer.await {
        error!("message consumer ended abnormally: {err}");
    }
    info!("gembotd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("listen for ctrl-c failed: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// First non-empty of the primary file, the fallback file and the built-in prompt.
fn load_system_prompt(workspace_root: &Path, bot: &BotConfig) -> String {
    let candidates = [
        ("primary", bot.system_prompt_path.as_str()),
        ("fallback", bot.system_prompt_fallback_path.as_str()),
    ];
    for (source, raw) in candidates {
        if raw.trim().is_empty() {
            continue;
        }
        let path = resolve_path(workspace_root, raw);
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                info!(
                    "system prompt loaded: source={} path={} chars={}",
                    source,
                    path.display(),
                    text.trim().chars().count()
                );
                return text.trim().to_string();
            }
            Ok(_) => warn!("system prompt file is empty: path={}", path.display()),
            Err(err) => info!("system prompt not read: path={} err={err}", path.display()),
        }
    }
    info!("system prompt loaded: source=builtin");
    BUILTIN_SYSTEM_PROMPT.trim().to_string()
}

fn resolve_path(workspace_root: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw.trim());
    if p.is_absolute() {
        p
    } else {
        workspace_root.join(p)
    }
}

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let data = HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        queue_capacity: state.dispatch.capacity(),
        queue_available: state.dispatch.available(),
        known_sessions: state.sessions.known_sessions(),
    };
    Json(ApiResponse {
        ok: true,
        data: Some(data),
        error: None,
    })
}

async fn submit_message(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> (StatusCode, Json<ApiResponse<OutboundReply>>) {
    let request_id = Uuid::new_v4();
    info!(
        "message received request_id={} chat_id={} sender={} group={}",
        request_id, message.chat_id, message.sender, message.is_group
    );
    match state.dispatch.submit(message).await {
        Ok(reply) => {
            info!(
                "message answered request_id={} ignored={} files={}",
                request_id,
                reply.is_empty(),
                reply.files.len()
            );
            (
                StatusCode::OK,
                Json(ApiResponse {
                    ok: true,
                    data: Some(reply),
                    error: None,
                }),
            )
        }
        Err(err) => {
            let status = match err {
                DispatchError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Closed | DispatchError::ReplyDropped => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            warn!("message rejected request_id={} err={}", request_id, err);
            (
                status,
                Json(ApiResponse {
                    ok: false,
                    data: None,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

pub(crate) fn truncate_for_log(text: &str) -> String {
    if text.len() <= LOG_PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let mut out = utf8_safe_prefix(text, LOG_PREVIEW_MAX_CHARS).to_string();
    out.push_str("...(truncated)");
    out
}

fn utf8_safe_prefix(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut cut = 0usize;
    for (idx, ch) in text.char_indices() {
        let next = idx + ch.len_utf8();
        if next > max_len {
            break;
        }
        cut = next;
    }
    &text[..cut]
}

pub(crate) fn now_ts_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
