//! Shared domain types: the client-facing error taxonomy and the routing
//! context extracted from tracking headers.

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use serde::Serialize;

use crate::config::HeadersConfig;

/// Errors surfaced at the client boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no backend available for model: {0}")]
    NoBackendAvailable(String),

    #[error("upstream timeout on backend {backend_id}")]
    UpstreamTimeout { backend_id: String },

    #[error("upstream error on backend {backend_id}: {detail}")]
    UpstreamError { backend_id: String, detail: String },

    #[error("client cancelled")]
    ClientCancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UnknownModel(_) => StatusCode::NOT_FOUND,
            ProxyError::NoBackendAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            // No response is ever written for a cancelled client; the status
            // only feeds logging.
            ProxyError::ClientCancelled => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::BadRequest(_) => ErrorKind::BadRequest,
            ProxyError::UnknownModel(_) => ErrorKind::UnknownModel,
            ProxyError::NoBackendAvailable(_) => ErrorKind::NoBackendAvailable,
            ProxyError::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            ProxyError::UpstreamError { .. } => ErrorKind::UpstreamError,
            ProxyError::ClientCancelled => ErrorKind::ClientCancelled,
            ProxyError::Internal(_) => ErrorKind::Internal,
        }
    }

    fn backend_id(&self) -> Option<&str> {
        match self {
            ProxyError::UpstreamTimeout { backend_id }
            | ProxyError::UpstreamError { backend_id, .. } => Some(backend_id),
            _ => None,
        }
    }

    /// Render the `{"error": {...}}` response body for this error.
    pub fn into_response(self) -> Response<Body> {
        let mut error = serde_json::json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        if let Some(id) = self.backend_id() {
            error["backend_id"] = serde_json::Value::String(id.to_string());
        }
        let body = serde_json::json!({ "error": error });

        let mut builder = Response::builder()
            .status(self.status())
            .header("Content-Type", "application/json");
        if matches!(self, ProxyError::NoBackendAvailable(_)) {
            builder = builder.header("Retry-After", "5");
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("static response construction")
    }
}

/// Error classification carried on turn records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    UnknownModel,
    NoBackendAvailable,
    UpstreamTimeout,
    UpstreamError,
    ClientCancelled,
    Internal,
}

/// Per-request tracking identifiers and agent-reported timings, read from
/// the configured header names.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub client_id: Option<String>,
    pub pre_ms: Option<f64>,
    pub post_ms: Option<f64>,
}

impl RoutingContext {
    /// Extract the context from request headers. Malformed timing values are
    /// ignored rather than rejected.
    pub fn from_headers(config: &HeadersConfig, headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };
        let get_ms = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
        };

        Self {
            session_id: get(&config.session),
            task_id: get(&config.task),
            client_id: get(&config.client),
            pre_ms: get_ms(&config.timing_pre),
            post_ms: get_ms(&config.timing_post),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_routing_context_extraction() {
        let config = HeadersConfig::default();
        let map = headers(&[
            ("X-Session-ID", "sess-1"),
            ("X-Task-ID", "task-9"),
            ("X-Client-ID", "agent-3"),
            ("X-Timing-Pre-Ms", "150.5"),
            ("X-Timing-Post-Ms", "20"),
        ]);

        let ctx = RoutingContext::from_headers(&config, &map);
        assert_eq!(ctx.session_id.as_deref(), Some("sess-1"));
        assert_eq!(ctx.task_id.as_deref(), Some("task-9"));
        assert_eq!(ctx.client_id.as_deref(), Some("agent-3"));
        assert_eq!(ctx.pre_ms, Some(150.5));
        assert_eq!(ctx.post_ms, Some(20.0));
    }

    #[test]
    fn test_malformed_timing_ignored() {
        let config = HeadersConfig::default();
        let map = headers(&[
            ("X-Timing-Pre-Ms", "not-a-number"),
            ("X-Timing-Post-Ms", "-5"),
        ]);

        let ctx = RoutingContext::from_headers(&config, &map);
        assert_eq!(ctx.pre_ms, None);
        assert_eq!(ctx.post_ms, None);
    }

    #[test]
    fn test_custom_header_names() {
        let config = HeadersConfig {
            session: "X-Episode".to_string(),
            ..HeadersConfig::default()
        };
        let map = headers(&[("X-Episode", "ep-7")]);

        let ctx = RoutingContext::from_headers(&config, &map);
        assert_eq!(ctx.session_id.as_deref(), Some("ep-7"));
    }

    #[test]
    fn test_error_response_shape() {
        let err = ProxyError::UpstreamError {
            backend_id: "m-0".to_string(),
            detail: "connect refused".to_string(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_no_backend_sets_retry_after() {
        let resp = ProxyError::NoBackendAvailable("m".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "5");
    }
}
