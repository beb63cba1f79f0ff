//! Reverse proxy forwarding: ingress routes, backend selection, upstream
//! relay with failover, and turn-record capture.
//!
//! The request body is buffered once (it is needed for model extraction and
//! for retries); the response is relayed as a byte stream so SSE chunks
//! flush incrementally. A finalizer travels with each dispatched attempt
//! and settles the in-flight slot and the turn record exactly once, on
//! completion, failure, deadline, or client disconnect.

use crate::config::{HeadersConfig, ProxyConfig};
use crate::registry::{BackendRegistry, InFlightToken};
use crate::selection::Selector;
use crate::sessions::{SessionStore, TurnRecord};
use crate::types::{ErrorKind, ProxyError, RoutingContext};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::{counter, gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Request headers never forwarded upstream, response headers never relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Marker body that makes an upstream 5xx retriable on another candidate.
const UPSTREAM_UNAVAILABLE: &[u8] = b"upstream_unavailable";

/// Shared state for the ingress handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<BackendRegistry>,
    pub selector: Arc<Selector>,
    pub sessions: Arc<SessionStore>,
    pub headers: Arc<HeadersConfig>,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
    max_retries: usize,
    /// Requests accepted but not yet dispatched to a backend
    pending: Arc<AtomicUsize>,
}

impl ProxyState {
    pub fn new(
        proxy: &ProxyConfig,
        headers: HeadersConfig,
        registry: Arc<BackendRegistry>,
        selector: Arc<Selector>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(proxy.connect_timeout()));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            registry,
            selector,
            sessions,
            headers: Arc::new(headers),
            client,
            request_timeout: proxy.request_timeout(),
            max_retries: proxy.max_retries,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests currently waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Build the client-facing ingress router.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// OpenAI-compatible model list: every model with at least one selectable
/// backend.
async fn list_models(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .registry
        .served_models()
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "agent-infra",
            })
        })
        .collect();
    Json(serde_json::json!({"object": "list", "data": data}))
}

/// Routed endpoint shared by `/v1/chat/completions` and `/v1/completions`.
async fn completions(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let accepted_at = Instant::now();
    let started_at_ms = now_millis();
    counter!("agent_proxy_requests_total").increment(1);
    let _pending = PendingGuard::new(Arc::clone(&state.pending));

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let ctx = RoutingContext::from_headers(&state.headers, &parts.headers);

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return finish_error(
                &state,
                &ctx,
                "",
                accepted_at,
                started_at_ms,
                ProxyError::BadRequest("failed to read request body".to_string()),
            );
        }
    };

    let Some(model) = extract_model(&body_bytes) else {
        return finish_error(
            &state,
            &ctx,
            "",
            accepted_at,
            started_at_ms,
            ProxyError::BadRequest("missing or unparseable 'model' field".to_string()),
        );
    };

    if !state.registry.has_model(&model) {
        return finish_error(
            &state,
            &ctx,
            &model,
            accepted_at,
            started_at_ms,
            ProxyError::UnknownModel(model.clone()),
        );
    }

    forward(&state, &parts.method, &parts.headers, &path, body_bytes, model, ctx, accepted_at, started_at_ms)
        .await
}

/// Dispatch to a selected backend, retrying retriable failures on a
/// different candidate until `max_retries` is exhausted.
#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &ProxyState,
    method: &Method,
    req_headers: &HeaderMap,
    path: &str,
    body: Bytes,
    model: String,
    ctx: RoutingContext,
    accepted_at: Instant,
    started_at_ms: u64,
) -> Response<Body> {
    let deadline = accepted_at + state.request_timeout;
    let mut excluded: Vec<String> = Vec::new();
    let mut retries_left = state.max_retries;
    let mut last_failure: Option<ProxyError> = None;

    loop {
        let mut candidates = state.registry.list_for_model(&model);
        candidates.retain(|c| !excluded.contains(&c.id));

        let Some(chosen) = state
            .selector
            .select(&model, &candidates, ctx.session_id.as_deref())
        else {
            // Exhausted candidates: a fresh request gets 503, a request that
            // already burned an attempt reports the upstream failure.
            let err = last_failure
                .take()
                .unwrap_or_else(|| ProxyError::NoBackendAvailable(model.clone()));
            return finish_error(state, &ctx, &model, accepted_at, started_at_ms, err);
        };

        let Some(token) = state.registry.observe_start(&chosen.id) else {
            // Lost a race with removal or the concurrency cap; skip this id.
            excluded.push(chosen.id.clone());
            continue;
        };

        let queue_wait_ms = millis_between(accepted_at, Instant::now());
        let mut fin = TurnFinalizer::new(
            state,
            token,
            ctx.clone(),
            model.clone(),
            chosen.id.clone(),
            accepted_at,
            started_at_ms,
            queue_wait_ms,
        );

        let upstream_req =
            match build_upstream_request(method, req_headers, &chosen.endpoint, path, body.clone())
            {
                Ok(r) => r,
                Err(e) => {
                    fin.status_code = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
                    fin.finish(TurnOutcome::Failed(ErrorKind::Internal));
                    return e.into_response();
                }
            };

        fin.sent_at = Instant::now();
        let remaining = deadline.saturating_duration_since(fin.sent_at);
        debug!(
            backend = %chosen.id,
            endpoint = %chosen.endpoint,
            model = %model,
            "Forwarding request"
        );

        let response =
            match tokio::time::timeout(remaining, state.client.request(upstream_req)).await {
                Err(_) => {
                    // Overall deadline hit before response headers: terminal.
                    fin.status_code = StatusCode::GATEWAY_TIMEOUT.as_u16();
                    fin.finish(TurnOutcome::Failed(ErrorKind::UpstreamTimeout));
                    return ProxyError::UpstreamTimeout { backend_id: chosen.id.clone() }
                        .into_response();
                }
                Ok(Err(e)) => {
                    // Connect refused/timeout or the connection died before
                    // headers: retriable on a different candidate.
                    let failure = ProxyError::UpstreamError {
                        backend_id: chosen.id.clone(),
                        detail: e.to_string(),
                    };
                    warn!(backend = %chosen.id, error = %e, "Upstream request failed");
                    if retries_left == 0 {
                        fin.status_code = StatusCode::BAD_GATEWAY.as_u16();
                        fin.finish(TurnOutcome::Failed(ErrorKind::UpstreamError));
                        return failure.into_response();
                    }
                    let token = fin.abandon();
                    state.registry.observe_end(
                        token,
                        millis_between(accepted_at, Instant::now()),
                        false,
                    );
                    excluded.push(chosen.id.clone());
                    last_failure = Some(failure);
                    retries_left -= 1;
                    counter!("agent_proxy_retries_total", "model" => model.clone()).increment(1);
                    continue;
                }
                Ok(Ok(response)) => response,
            };

        let status = response.status();
        let (mut resp_parts, resp_body) = response.into_parts();
        strip_hop_by_hop(&mut resp_parts.headers);

        if status.is_server_error() {
            // 5xx bodies are small; buffer to sniff the retriable marker.
            let collect_budget = deadline.saturating_duration_since(Instant::now());
            let collected =
                match tokio::time::timeout(collect_budget, resp_body.collect()).await {
                    Ok(Ok(collected)) => collected.to_bytes(),
                    Ok(Err(e)) => {
                        warn!(backend = %chosen.id, error = %e, "Upstream 5xx body unreadable");
                        Bytes::new()
                    }
                    Err(_) => {
                        fin.status_code = StatusCode::GATEWAY_TIMEOUT.as_u16();
                        fin.finish(TurnOutcome::Failed(ErrorKind::UpstreamTimeout));
                        return ProxyError::UpstreamTimeout { backend_id: chosen.id.clone() }
                            .into_response();
                    }
                };

            let retriable = collected
                .windows(UPSTREAM_UNAVAILABLE.len())
                .any(|w| w == UPSTREAM_UNAVAILABLE);
            if retriable {
                let failure = ProxyError::UpstreamError {
                    backend_id: chosen.id.clone(),
                    detail: format!("upstream unavailable ({status})"),
                };
                if retries_left == 0 {
                    fin.status_code = StatusCode::BAD_GATEWAY.as_u16();
                    fin.finish(TurnOutcome::Failed(ErrorKind::UpstreamError));
                    return failure.into_response();
                }
                warn!(backend = %chosen.id, status = %status, "Upstream unavailable; retrying");
                let token = fin.abandon();
                state.registry.observe_end(
                    token,
                    millis_between(accepted_at, Instant::now()),
                    false,
                );
                excluded.push(chosen.id.clone());
                last_failure = Some(failure);
                retries_left -= 1;
                counter!("agent_proxy_retries_total", "model" => model.clone()).increment(1);
                continue;
            }

            // Relay the upstream error verbatim; the failure still counts
            // against the backend's health.
            fin.status_code = status.as_u16();
            fin.last_byte_at = Some(Instant::now());
            fin.finish(TurnOutcome::Failed(ErrorKind::UpstreamError));
            resp_parts.headers.remove(header::CONTENT_LENGTH);
            return Response::from_parts(resp_parts, Body::from(collected));
        }

        // Success path: relay the byte stream verbatim. The finalizer rides
        // inside the body and settles when the stream ends, errors, hits the
        // deadline, or the client goes away.
        fin.status_code = status.as_u16();
        fin.streamed = is_event_stream(&resp_parts.headers);
        let relay = RelayBody::new(resp_body, fin, deadline);
        return Response::from_parts(resp_parts, Body::new(relay));
    }
}

/// Extract the model name from the JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
        && !model.is_empty()
    {
        return Some(model.to_string());
    }
    None
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

/// Rebuild the client request against the chosen backend: rewritten
/// authority, hop-by-hop and `Host` headers dropped, buffered body attached.
fn build_upstream_request(
    method: &Method,
    req_headers: &HeaderMap,
    endpoint: &str,
    path: &str,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, ProxyError> {
    let uri: Uri = format!("http://{endpoint}{path}")
        .parse()
        .map_err(|e| ProxyError::Internal(format!("invalid upstream URI: {e}")))?;

    let mut builder = Request::builder().method(method.clone()).uri(uri);
    for (name, value) in req_headers {
        let n = name.as_str();
        if is_hop_by_hop(n) || n.eq_ignore_ascii_case("host") || n.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(body))
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {e}")))
}

/// Record a turn for a request that failed before (or instead of) producing
/// an upstream response, then render the error.
fn finish_error(
    state: &ProxyState,
    ctx: &RoutingContext,
    model: &str,
    accepted_at: Instant,
    started_at_ms: u64,
    err: ProxyError,
) -> Response<Body> {
    let kind = err.kind();
    let status = err.status();
    counter!("agent_proxy_errors_total", "kind" => format!("{kind:?}")).increment(1);
    debug!(model = %model, error = %err, "Request failed");

    state.sessions.record(TurnRecord {
        session_id: ctx.session_id.clone().unwrap_or_default(),
        task_id: ctx.task_id.clone().unwrap_or_default(),
        client_id: ctx.client_id.clone().unwrap_or_default(),
        model_name: model.to_string(),
        backend_id: String::new(),
        queue_wait_ms: 0.0,
        inference_ms: 0.0,
        pre_ms: ctx.pre_ms.unwrap_or(0.0),
        post_ms: ctx.post_ms.unwrap_or(0.0),
        total_ms: millis_between(accepted_at, Instant::now()),
        status_code: status.as_u16(),
        streamed: false,
        error_kind: Some(kind),
        started_at_ms,
    });
    err.into_response()
}

fn millis_between(start: Instant, end: Instant) -> f64 {
    end.saturating_duration_since(start).as_secs_f64() * 1000.0
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tracks requests between acceptance and dispatch for `/admin/queue`.
struct PendingGuard {
    pending: Arc<AtomicUsize>,
}

impl PendingGuard {
    fn new(pending: Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self { pending }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

enum TurnOutcome {
    Completed,
    Failed(ErrorKind),
    Cancelled,
}

/// Settles one dispatched attempt exactly once: releases the in-flight
/// token, records the turn, and emits metrics. Dropping it unfinished means
/// the client went away, which maps to `ClientCancelled`.
struct TurnFinalizer {
    registry: Arc<BackendRegistry>,
    sessions: Arc<SessionStore>,
    token: Option<InFlightToken>,
    ctx: RoutingContext,
    model_name: String,
    backend_id: String,
    accepted_at: Instant,
    started_at_ms: u64,
    queue_wait_ms: f64,
    sent_at: Instant,
    last_byte_at: Option<Instant>,
    status_code: u16,
    streamed: bool,
    done: bool,
}

impl TurnFinalizer {
    #[allow(clippy::too_many_arguments)]
    fn new(
        state: &ProxyState,
        token: InFlightToken,
        ctx: RoutingContext,
        model_name: String,
        backend_id: String,
        accepted_at: Instant,
        started_at_ms: u64,
        queue_wait_ms: f64,
    ) -> Self {
        Self {
            registry: Arc::clone(&state.registry),
            sessions: Arc::clone(&state.sessions),
            token: Some(token),
            ctx,
            model_name,
            backend_id,
            accepted_at,
            started_at_ms,
            queue_wait_ms,
            sent_at: Instant::now(),
            last_byte_at: None,
            status_code: 0,
            streamed: false,
            done: false,
        }
    }

    /// Hand the token back for an attempt that will be retried elsewhere.
    /// No turn record is written; the retry's attempt owns the turn.
    fn abandon(&mut self) -> InFlightToken {
        self.done = true;
        self.token.take().expect("abandon called once")
    }

    fn finish(&mut self, outcome: TurnOutcome) {
        if self.done {
            return;
        }
        self.done = true;

        let now = Instant::now();
        let total_ms = millis_between(self.accepted_at, now);
        let inference_ms = millis_between(self.sent_at, self.last_byte_at.unwrap_or(now));

        let (ok, error_kind, label) = match outcome {
            TurnOutcome::Completed => (true, None, "ok"),
            TurnOutcome::Failed(kind) => (false, Some(kind), "failed"),
            TurnOutcome::Cancelled => (false, Some(ErrorKind::ClientCancelled), "cancelled"),
        };

        if let Some(token) = self.token.take() {
            if matches!(error_kind, Some(ErrorKind::ClientCancelled)) {
                // Not a backend fault: release the slot without touching the
                // latency window or the failure counter.
                self.registry.observe_cancel(token);
            } else {
                self.registry.observe_end(token, total_ms, ok);
            }
        }

        histogram!("agent_proxy_request_duration_seconds", "model" => self.model_name.clone())
            .record(total_ms / 1000.0);
        counter!(
            "agent_proxy_turns_total",
            "model" => self.model_name.clone(),
            "outcome" => label
        )
        .increment(1);

        debug!(
            backend = %self.backend_id,
            model = %self.model_name,
            status = self.status_code,
            outcome = label,
            total_ms,
            "Turn finished"
        );

        self.sessions.record(TurnRecord {
            session_id: self.ctx.session_id.clone().unwrap_or_default(),
            task_id: self.ctx.task_id.clone().unwrap_or_default(),
            client_id: self.ctx.client_id.clone().unwrap_or_default(),
            model_name: self.model_name.clone(),
            backend_id: self.backend_id.clone(),
            queue_wait_ms: self.queue_wait_ms,
            inference_ms,
            pre_ms: self.ctx.pre_ms.unwrap_or(0.0),
            post_ms: self.ctx.post_ms.unwrap_or(0.0),
            total_ms,
            status_code: self.status_code,
            streamed: self.streamed,
            error_kind,
            started_at_ms: self.started_at_ms,
        });

        gauge!("agent_proxy_sessions").set(self.sessions.session_count() as f64);
    }
}

impl Drop for TurnFinalizer {
    fn drop(&mut self) {
        if !self.done {
            debug!(backend = %self.backend_id, "Client disconnected; cancelling upstream");
            self.finish(TurnOutcome::Cancelled);
        }
    }
}

/// Response body that relays upstream frames to the client while tracking
/// byte timing and the overall deadline. Dropping it cancels the upstream
/// connection (hyper aborts the request when `Incoming` is dropped).
struct RelayBody {
    inner: Incoming,
    finalizer: TurnFinalizer,
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl RelayBody {
    fn new(inner: Incoming, finalizer: TurnFinalizer, deadline: Instant) -> Self {
        Self {
            inner,
            finalizer,
            deadline: Box::pin(tokio::time::sleep_until(deadline.into())),
        }
    }
}

impl HttpBody for RelayBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.finalizer.done {
            return Poll::Ready(None);
        }
        if this.deadline.as_mut().poll(cx).is_ready() {
            // Bytes already went out; all we can do is truncate.
            warn!(
                backend = %this.finalizer.backend_id,
                "Request deadline exceeded mid-stream; truncating response"
            );
            this.finalizer.finish(TurnOutcome::Failed(ErrorKind::UpstreamTimeout));
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if frame.data_ref().is_some() {
                    this.finalizer.last_byte_at = Some(Instant::now());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Past the first relayed byte every failure is terminal.
                this.finalizer.finish(TurnOutcome::Failed(ErrorKind::UpstreamError));
                Poll::Ready(Some(Err(axum::Error::new(e))))
            }
            Poll::Ready(None) => {
                this.finalizer.finish(TurnOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finalizer.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_model_from_body() {
        let body = Bytes::from(r#"{"model": "llama", "messages": []}"#);
        assert_eq!(extract_model(&body), Some("llama".to_string()));
    }

    #[test]
    fn test_extract_model_missing() {
        assert_eq!(extract_model(&Bytes::from(r#"{"messages": []}"#)), None);
        assert_eq!(extract_model(&Bytes::from("not json")), None);
        assert_eq!(extract_model(&Bytes::from(r#"{"model": ""}"#)), None);
        assert_eq!(extract_model(&Bytes::from(r#"{"model": 42}"#)), None);
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("x-session-id", "s1".parse().unwrap());

        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-session-id").unwrap(), "s1");
    }

    #[test]
    fn test_build_upstream_request_rewrites_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "proxy.example:5800".parse().unwrap());
        headers.insert("content-length", "12".parse().unwrap());
        headers.insert("authorization", "Bearer x".parse().unwrap());

        let req = build_upstream_request(
            &Method::POST,
            &headers,
            "127.0.0.1:5900",
            "/v1/chat/completions",
            Bytes::from_static(b"{}"),
        )
        .unwrap();

        assert_eq!(req.uri().host(), Some("127.0.0.1"));
        assert_eq!(req.uri().path(), "/v1/chat/completions");
        assert!(req.headers().get("host").is_none());
        assert!(req.headers().get("content-length").is_none());
        assert_eq!(req.headers().get("authorization").unwrap(), "Bearer x");
    }

    #[test]
    fn test_is_event_stream() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers));
        headers.insert("content-type", "text/event-stream; charset=utf-8".parse().unwrap());
        assert!(is_event_stream(&headers));
        headers.insert("content-type", "application/json".parse().unwrap());
        assert!(!is_event_stream(&headers));
    }
}
