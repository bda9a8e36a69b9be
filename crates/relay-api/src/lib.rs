//! HTTP transport surface: binds the request engine's `handle_chat`
//! and `metrics_report` contracts onto OpenAI-compatible chat routes,
//! plus health/models endpoints and a Prometheus `/metrics` scrape
//! independent of the engine.

pub mod probe;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use relay_backend::{router::Router as NamedRouter, BackendDispatcher};
use relay_common::config::{RouterConfig, Settings};
use relay_core::{ChatOutcome, DeviceRegistry, EchoRunner, RequestEngine, RequestMeta};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<RequestEngine>,
    settings: Arc<Settings>,
    named_router: Option<Arc<NamedRouter>>,
}

/// Builds the engine from settings: probes devices, constructs the
/// round-robin dispatcher, and hands both to `RequestEngine::new`.
/// A shard-configuration error here (too many devices for
/// `total_layers`) is fatal.
pub fn build_engine(settings: &Settings) -> relay_common::Result<Arc<RequestEngine>> {
    let mut registry = DeviceRegistry::new();
    registry.add_all(probe::probe_devices());

    let dispatcher = BackendDispatcher::new(settings.backends.clone(), settings.model_id.clone());

    let engine = RequestEngine::new(
        registry,
        dispatcher,
        settings.batch_size,
        settings.batch_wait_ms,
        settings.metrics_max_items,
        settings.total_layers,
    )?;
    Ok(Arc::new(engine))
}

/// Assembles the axum router over a freshly built engine. Fatal
/// construction errors (shard config) propagate to the caller, which
/// the binary entry point surfaces as a hard startup failure.
pub fn app(settings: Settings) -> relay_common::Result<Router> {
    relay_obs::init();
    relay_obs::spawn_gpu_polling();

    let engine = build_engine(&settings)?;
    let named_router = settings
        .router_config_path
        .as_deref()
        .and_then(RouterConfig::load)
        .map(|cfg| Arc::new(NamedRouter::from_config(&cfg)));

    let state = AppState {
        engine,
        settings: Arc::new(settings),
        named_router,
    };

    Ok(build_router(state))
}

/// Builds the router over an already-constructed app state. Split out
/// from `app` so tests can wire an engine against stubbed devices
/// without going through environment-driven probing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi))
        .route("/v1/models", get(list_models))
        .route("/metrics", get(prometheus_metrics))
        .route("/v1/metrics", get(engine_metrics))
        .route("/debug/shard", get(shard_debug))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/chat/pretty", post(chat_completions_pretty))
        .route("/v1/router/chat", post(router_chat))
        .with_state(state)
}

impl AppState {
    pub fn new(engine: Arc<RequestEngine>, settings: Settings) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            named_router: None,
        }
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Descriptor enumerating the HTTP surface. Static, not derived from
/// the router, as the teacher's `runner-api::openapi` is.
async fn openapi() -> impl IntoResponse {
    Json(json!({
        "openapi": "3.0.0",
        "info": {"title": "RelayServe API", "version": "0.1.0"},
        "paths": {
            "/v1/chat/completions": {"post": {"summary": "OpenAI-compatible chat completions, with SSE streaming via stream: true"}},
            "/v1/chat/pretty": {"post": {"summary": "Chat completions rendered as human-readable text"}},
            "/v1/router/chat": {"post": {"summary": "Chat completions via the named multi-backend router"}},
            "/v1/models": {"get": {"summary": "List the configured model id"}},
            "/v1/metrics": {"get": {"summary": "Engine metrics report: stats, queue depth, kv, shard plan"}},
            "/debug/shard": {"get": {"summary": "Current shard plan"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "Liveness probe"}}
        }
    }))
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "data": [{"id": state.settings.model_id, "object": "model"}],
    }))
}

/// Prometheus text-format scrape. Mirrors the engine's queue depth and
/// KV counters into gauges on every scrape (the engine computes these
/// on demand, so there is nothing to poll on a timer).
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    use prometheus::{Encoder, TextEncoder};

    let report = state.engine.metrics_report();
    relay_obs::observe_engine(report.queue_depth, state.engine.last_batch_size(), &report.kv);

    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics encode failed").into_response();
    }
    ([("content-type", encoder.format_type().to_string())], buffer).into_response()
}

/// JSON rendering of the engine's `metrics_report()` contract:
/// `{stats, queue_depth, kv, shard_plan}`.
async fn engine_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.metrics_report();
    json_response(state.settings.pretty_json, StatusCode::OK, &report)
}

async fn shard_debug(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.metrics_report();
    json_response(state.settings.pretty_json, StatusCode::OK, &report.shard_plan)
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    format: Option<String>,
}

fn extract_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default()
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Response {
    handle_chat_request(state, headers, req, false).await
}

async fn chat_completions_pretty(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Response {
    handle_chat_request(state, headers, req, true).await
}

async fn handle_chat_request(
    state: AppState,
    headers: HeaderMap,
    req: ChatRequest,
    force_pretty: bool,
) -> Response {
    let prompt = extract_prompt(&req.messages);
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing_prompt"})),
        )
            .into_response();
    }

    if req.stream {
        return stream_chat(state, prompt, req.model).into_response();
    }

    let outcome = state.engine.handle_chat(prompt.clone()).await;
    let pretty = force_pretty || prefer_pretty(&state, &headers, req.format.as_deref());
    if pretty {
        (StatusCode::OK, format_pretty_text(&outcome)).into_response()
    } else {
        let response = format_chat_response(&state.settings.model_id, &prompt, &outcome);
        json_response(state.settings.pretty_json, StatusCode::OK, &response)
    }
}

fn prefer_pretty(state: &AppState, headers: &HeaderMap, format_field: Option<&str>) -> bool {
    if !state.settings.pretty_default {
        return false;
    }
    if format_field == Some("json") {
        return false;
    }
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    !accept.contains("application/json")
}

fn format_chat_response(model_id: &str, prompt: &str, outcome: &ChatOutcome) -> Value {
    let prompt_tokens = relay_core::engine::word_count(prompt);
    let completion_tokens = relay_core::engine::word_count(&outcome.reply);
    json!({
        "id": "relay-chat-1",
        "object": "chat.completion",
        "model": model_id,
        "relay": meta_json(&outcome.meta),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": outcome.reply},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

fn meta_json(meta: &RequestMeta) -> Value {
    json!({
        "device": meta.device,
        "backend": meta.backend,
        "queue_ms": meta.queue_ms,
        "ttft_ms": meta.ttft_ms,
        "batch_size": meta.batch_size,
    })
}

fn format_pretty_text(outcome: &ChatOutcome) -> String {
    format!(
        "\x1b[1;36mRelay Response\x1b[0m\n\
         \x1b[1;32mReply:\x1b[0m {}\n\
         \x1b[1;34mDevice:\x1b[0m {}\n\
         \x1b[1;35mBackend:\x1b[0m {}\n\
         \x1b[1;33mQueue:\x1b[0m {:.2} ms | \x1b[1;33mTTFT:\x1b[0m {:.2} ms | \x1b[1;33mBatch:\x1b[0m {}\n",
        outcome.reply,
        outcome.meta.device,
        outcome.meta.backend,
        outcome.meta.queue_ms,
        outcome.meta.ttft_ms,
        outcome.meta.batch_size,
    )
}

/// Streaming chat completions bypass the batching queue entirely: the
/// engine's per-item pipeline is defined over a blocking round trip,
/// while the stream must flush chunks as they arrive. The device pick
/// still goes through the registry, since
/// streaming endpoints are a transport concern layered over the same
/// backend dispatcher (component F).
fn stream_chat(state: AppState, prompt: String, requested_model: Option<String>) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let model_id = requested_model.unwrap_or_else(|| state.settings.model_id.clone());
    let request_id = format!("relay-{}", uuid::Uuid::new_v4().simple());
    let device = state.engine.registry().best_device();
    let dispatcher = state.engine.dispatcher();

    let stream = async_stream::stream! {
        let Some(device) = device else {
            yield Ok(done_event());
            return;
        };

        let mut emitted = false;
        if dispatcher.has_backends() {
            let mut chunks = dispatcher.chat_stream(prompt.clone(), request_id.clone(), model_id.clone());
            while let Some(chunk) = chunks.next().await {
                emitted = true;
                if let Ok(event) = Event::default().json_data(&chunk) {
                    yield Ok(event);
                }
            }
        }

        if !emitted {
            let reply = EchoRunner::new().run(&device, &prompt);
            let chunk = synthetic_chunk(&request_id, &model_id, &reply);
            if let Ok(event) = Event::default().json_data(&chunk) {
                yield Ok(event);
            }
        }

        yield Ok(done_event());
    };

    Sse::new(stream)
}

fn synthetic_chunk(request_id: &str, model_id: &str, content: &str) -> Value {
    json!({
        "id": request_id,
        "object": "chat.completion.chunk",
        "model": model_id,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
    })
}

fn done_event() -> Event {
    Event::default().data("[DONE]")
}

fn json_response(pretty: bool, status: StatusCode, value: &impl Serialize) -> Response {
    let body = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    };
    match body {
        Ok(bytes) => (status, [("content-type", "application/json")], bytes).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "serialization error").into_response(),
    }
}

/// Supplemental endpoint for the optional, config-driven named
/// multi-backend router. Absent a `--router-config`/
/// `RELAYSERVE_ROUTER_CONFIG` file this route is a 404; it never
/// changes the primary chat-completions path's per-item processing.
#[derive(Debug, Deserialize)]
struct RouterChatRequest {
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

async fn router_chat(State(state): State<AppState>, Json(req): Json<RouterChatRequest>) -> Response {
    let Some(router) = &state.named_router else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "router_not_configured"})),
        )
            .into_response();
    };

    let prompt = extract_prompt(&req.messages);
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing_prompt"})),
        )
            .into_response();
    }

    let Some(backend) = router.get_backend(req.model.as_deref()) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no_backends"})),
        )
            .into_response();
    };

    let reply = backend.generate(&prompt).await.unwrap_or_default();
    json_response(
        state.settings.pretty_json,
        StatusCode::OK,
        &json!({
            "id": "relay-router-chat-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": reply},
                "finish_reason": "stop",
            }],
        }),
    )
}
