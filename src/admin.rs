//! Read-only admin surface for the dashboard.
//!
//! Served under `/admin/` on the same listener as the proxy routes. Every
//! endpoint returns a consistent snapshot taken under brief read locks;
//! clients poll at their own cadence.
//!
//! | Method | Path                    | Description                               |
//! |--------|-------------------------|-------------------------------------------|
//! | GET    | `/admin/backends`       | Backend snapshots                          |
//! | GET    | `/admin/queue`          | Pending/in-flight counts and throughput    |
//! | GET    | `/admin/sessions`       | Session summaries, most recent first       |
//! | GET    | `/admin/sessions/{id}`  | Turn records for one session               |
//! | GET    | `/admin/bottleneck`     | Stage-dominance diagnosis (`?session=`)    |

use crate::proxy::ProxyState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

/// Build the admin router.
pub fn admin_router(state: ProxyState) -> Router {
    Router::new()
        .route("/admin/backends", get(get_backends))
        .route("/admin/queue", get(get_queue))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/{id}", get(get_session))
        .route("/admin/bottleneck", get(get_bottleneck))
        .with_state(state)
}

#[derive(Serialize)]
struct QueueResponse {
    pending: usize,
    in_flight: usize,
    requests_per_s: f64,
    mean_latency_ms: f64,
    strategy: &'static str,
}

#[derive(Deserialize)]
struct SessionsQuery {
    limit: Option<usize>,
    /// Unix millis; sessions idle since before this instant are omitted
    since: Option<u64>,
}

#[derive(Deserialize)]
struct BottleneckQuery {
    session: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn get_backends(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"backends": state.registry.snapshot()}))
}

async fn get_queue(State(state): State<ProxyState>) -> Json<QueueResponse> {
    let throughput = state.sessions.throughput();
    Json(QueueResponse {
        pending: state.pending(),
        in_flight: state.registry.total_in_flight(),
        requests_per_s: throughput.requests_per_s,
        mean_latency_ms: throughput.mean_latency_ms,
        strategy: state.selector.strategy().as_str(),
    })
}

async fn list_sessions(
    State(state): State<ProxyState>,
    Query(query): Query<SessionsQuery>,
) -> Json<serde_json::Value> {
    let summaries = state
        .sessions
        .list_sessions(query.limit.unwrap_or(100), query.since);
    Json(serde_json::json!({"sessions": summaries}))
}

async fn get_session(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.sessions.get_session(&id) {
        Some(turns) => Ok(Json(serde_json::json!({
            "session_id": id,
            "turns": turns,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session not found: {id}"),
            }),
        )),
    }
}

async fn get_bottleneck(
    State(state): State<ProxyState>,
    Query(query): Query<BottleneckQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let mean_load = mean_backend_load(&state);
    match state
        .sessions
        .bottleneck_report(query.session.as_deref(), mean_load)
    {
        Some(report) => Ok(Json(serde_json::to_value(report).unwrap_or_default())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!(
                    "Session not found: {}",
                    query.session.as_deref().unwrap_or_default()
                ),
            }),
        )),
    }
}

/// Mean GPU load across backends that have reported one.
fn mean_backend_load(state: &ProxyState) -> f64 {
    let loads: Vec<f64> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|b| b.load)
        .filter(|l| !l.is_nan())
        .collect();
    if loads.is_empty() {
        0.0
    } else {
        loads.iter().sum::<f64>() / loads.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendDescriptor;
    use crate::config::{HeadersConfig, ProxyConfig};
    use crate::registry::BackendRegistry;
    use crate::selection::{Selector, Strategy};
    use crate::sessions::{SessionStore, TurnRecord};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn make_test_state() -> ProxyState {
        let registry = Arc::new(BackendRegistry::seed(vec![BackendDescriptor {
            id: "m-0".to_string(),
            model_name: "m".to_string(),
            endpoint: "127.0.0.1:5900".to_string(),
            max_in_flight: None,
        }]));
        ProxyState::new(
            &ProxyConfig::default(),
            HeadersConfig::default(),
            registry,
            Arc::new(Selector::new(Strategy::LeastLoad)),
            Arc::new(SessionStore::default()),
        )
    }

    fn turn(session: &str) -> TurnRecord {
        TurnRecord {
            session_id: session.to_string(),
            task_id: String::new(),
            client_id: String::new(),
            model_name: "m".to_string(),
            backend_id: "m-0".to_string(),
            queue_wait_ms: 1.0,
            inference_ms: 50.0,
            pre_ms: 0.0,
            post_ms: 0.0,
            total_ms: 51.0,
            status_code: 200,
            streamed: false,
            error_kind: None,
            started_at_ms: 0,
        }
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or_default();
        (status, json)
    }

    #[tokio::test]
    async fn test_backends_endpoint() {
        let state = make_test_state();
        let app = admin_router(state);

        let (status, json) = get_json(&app, "/admin/backends").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["backends"][0]["id"], "m-0");
        assert_eq!(json["backends"][0]["state"], "unknown");
        // Unknown load serializes as null
        assert!(json["backends"][0]["load"].is_null());
    }

    #[tokio::test]
    async fn test_queue_endpoint() {
        let state = make_test_state();
        state.sessions.record(turn("s1"));
        let app = admin_router(state);

        let (status, json) = get_json(&app, "/admin/queue").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pending"], 0);
        assert_eq!(json["in_flight"], 0);
        assert_eq!(json["strategy"], "least_load");
        assert!((json["mean_latency_ms"].as_f64().unwrap() - 51.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sessions_endpoints() {
        let state = make_test_state();
        state.sessions.record(turn("s1"));
        state.sessions.record(turn("s1"));
        let app = admin_router(state);

        let (status, json) = get_json(&app, "/admin/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessions"][0]["session_id"], "s1");
        assert_eq!(json["sessions"][0]["turns"], 2);

        let (status, json) = get_json(&app, "/admin/sessions/s1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["turns"].as_array().unwrap().len(), 2);

        let (status, _) = get_json(&app, "/admin/sessions/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bottleneck_endpoint() {
        let state = make_test_state();
        state.sessions.record(turn("s1"));
        let app = admin_router(state);

        let (status, json) = get_json(&app, "/admin/bottleneck").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["scope"], "global");
        assert_eq!(json["turns"], 1);

        let (status, json) = get_json(&app, "/admin/bottleneck?session=s1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["scope"], "s1");

        let (status, _) = get_json(&app, "/admin/bottleneck?session=missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
