//! Mock inference backend for testing the proxy.
//!
//! Speaks just enough of the backend-facing surface: OpenAI-compatible
//! completions (streaming and not), `/health`, and the `/metrics/load`
//! endpoint the health monitor probes. Control endpoints let tests inject
//! load figures, latency, and failures at runtime.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use bytes::Bytes;
use clap::Parser;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock OpenAI-compatible backend for testing")]
struct Args {
    /// Port to listen on (0 for dynamic allocation)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Model name to serve
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// Artificial latency for responses (ms)
    #[arg(long, default_value = "10")]
    latency_ms: u64,

    /// Initial reported GPU utilization
    #[arg(long, default_value = "0.5")]
    gpu_utilization: f64,
}

/// Server state
struct MockState {
    model: String,
    latency_ms: AtomicU64,
    gpu_utilization: RwLock<f64>,
    in_flight: AtomicUsize,
    request_count: AtomicU64,
    /// When true, completions return 500 with an `upstream_unavailable` body
    fail_requests: RwLock<bool>,
    /// When true, `/metrics/load` stops answering (probe failures)
    fail_probes: RwLock<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_backend=debug")
        .init();

    let args = Args::parse();

    let state = Arc::new(MockState {
        model: args.model.clone(),
        latency_ms: AtomicU64::new(args.latency_ms),
        gpu_utilization: RwLock::new(args.gpu_utilization),
        in_flight: AtomicUsize::new(0),
        request_count: AtomicU64::new(0),
        fail_requests: RwLock::new(false),
        fail_probes: RwLock::new(false),
    });

    let app = mock_router(state);

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let actual_port = listener.local_addr()?.port();

    info!(model = %args.model, port = actual_port, "Mock backend listening");

    // Signal readiness to stdout for test harnesses.
    // Format: "READY <port>" on its own line
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

fn mock_router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/load", get(metrics_load))
        .route("/v1/chat/completions", post(completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/stats", get(stats))
        .route("/control/load", post(control_load))
        .route("/control/latency", post(control_latency))
        .route("/control/fail", post(control_fail))
        .route("/control/fail-probes", post(control_fail_probes))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct LoadResponse {
    gpu_utilization: f64,
    in_flight: usize,
    model_name: String,
}

/// The load endpoint the proxy's health monitor probes.
async fn metrics_load(State(state): State<Arc<MockState>>) -> Response {
    if *state.fail_probes.read().await {
        warn!("Probe forced to fail via /control/fail-probes");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(LoadResponse {
        gpu_utilization: *state.gpu_utilization.read().await,
        in_flight: state.in_flight.load(Ordering::SeqCst),
        model_name: state.model.clone(),
    })
    .into_response()
}

#[derive(Deserialize)]
struct CompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize, Serialize)]
struct Message {
    role: String,
    content: String,
}

async fn completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    state.in_flight.fetch_add(1, Ordering::SeqCst);
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;

    if *state.fail_requests.read().await {
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        warn!("Request forced to fail via /control/fail");
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream_unavailable").into_response();
    }

    let latency = Duration::from_millis(state.latency_ms.load(Ordering::SeqCst));
    tokio::time::sleep(latency).await;

    info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.stream,
        request_num = count,
        "Serving completion"
    );

    let response = if request.stream {
        sse_response(&state, &request, count, latency)
    } else {
        let body = serde_json::json!({
            "id": format!("chatcmpl-mock-{count}"),
            "object": "chat.completion",
            "model": request.model.clone(),
            "served_by": state.model.clone(),
            "request_number": count,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": format!(
                        "Mock response from {} (request #{count}): you said \"{}\"",
                        state.model,
                        request.messages.last().map(|m| m.content.as_str()).unwrap_or("")
                    ),
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        });
        Json(body).into_response()
    };

    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

/// Build an SSE stream of three content chunks plus the `[DONE]` terminator,
/// paced by the configured latency.
fn sse_response(
    state: &Arc<MockState>,
    request: &CompletionRequest,
    count: u64,
    latency: Duration,
) -> Response {
    let model = request.model.clone();
    let chunks: Vec<Bytes> = ["Mock", " streamed", " response"]
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let delta = serde_json::json!({
                "id": format!("chatcmpl-mock-{count}"),
                "object": "chat.completion.chunk",
                "model": &model,
                "choices": [{"index": 0, "delta": {"content": text}, "finish_reason":
                    if i == 2 { serde_json::Value::String("stop".to_string()) } else { serde_json::Value::Null }}],
            });
            Bytes::from(format!("data: {delta}\n\n"))
        })
        .chain(std::iter::once(Bytes::from_static(b"data: [DONE]\n\n")))
        .collect();

    let pace = latency / 4;
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(pace).await;
        Ok::<Bytes, Infallible>(chunk)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response construction")
}

async fn list_models(State(state): State<Arc<MockState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [{"id": state.model.clone(), "object": "model", "owned_by": "mock-backend"}],
    }))
}

#[derive(Serialize)]
struct StatsResponse {
    model: String,
    request_count: u64,
    in_flight: usize,
    gpu_utilization: f64,
}

/// Inspection endpoint for tests.
async fn stats(State(state): State<Arc<MockState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        model: state.model.clone(),
        request_count: state.request_count.load(Ordering::SeqCst),
        in_flight: state.in_flight.load(Ordering::SeqCst),
        gpu_utilization: *state.gpu_utilization.read().await,
    })
}

#[derive(Deserialize)]
struct ControlLoad {
    gpu_utilization: f64,
}

async fn control_load(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlLoad>,
) -> StatusCode {
    info!(gpu_utilization = body.gpu_utilization, "Setting reported load");
    *state.gpu_utilization.write().await = body.gpu_utilization;
    StatusCode::OK
}

#[derive(Deserialize)]
struct ControlLatency {
    latency_ms: u64,
}

async fn control_latency(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlLatency>,
) -> StatusCode {
    info!(latency_ms = body.latency_ms, "Setting latency");
    state.latency_ms.store(body.latency_ms, Ordering::SeqCst);
    StatusCode::OK
}

#[derive(Deserialize)]
struct ControlFail {
    enabled: bool,
}

/// Make completions return 500 `upstream_unavailable`.
async fn control_fail(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlFail>,
) -> StatusCode {
    info!(enabled = body.enabled, "Setting fail_requests");
    *state.fail_requests.write().await = body.enabled;
    StatusCode::OK
}

/// Make `/metrics/load` return 500 so health probes fail.
async fn control_fail_probes(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlFail>,
) -> StatusCode {
    info!(enabled = body.enabled, "Setting fail_probes");
    *state.fail_probes.write().await = body.enabled;
    StatusCode::OK
}
