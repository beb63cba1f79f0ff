//! Periodic backend health probing.
//!
//! One driver task probes every registered backend once per interval, all
//! probes running concurrently so a slow backend cannot delay the rest. The
//! first sweep runs immediately on startup; until it completes, backends
//! stay `Unknown` and remain selectable so cold traffic can flow.

use crate::backend::ProbeOutcome;
use crate::registry::BackendRegistry;
use bytes::Bytes;
use futures_util::future::join_all;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Drives health probes against the registry.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    client: Client<HttpConnector, Full<Bytes>>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, interval: Duration, probe_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(probe_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            registry,
            client,
            interval,
            probe_timeout,
        }
    }

    /// Spawn the probe loop. The first sweep fires immediately.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!(interval = ?self.interval, "Starting health monitor");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                self.sweep().await;
                self.registry.reap();
            }
        })
    }

    /// Probe all backends concurrently and apply the outcomes.
    pub async fn sweep(&self) {
        let targets = self.registry.probe_targets();
        trace!(backends = targets.len(), "Health sweep");
        let probes = targets.into_iter().map(|(id, endpoint)| async move {
            let outcome = self.probe(&endpoint).await;
            if !outcome.ok {
                counter!("agent_proxy_probe_failures_total", "backend" => id.clone()).increment(1);
                debug!(backend = %id, endpoint = %endpoint, "Probe failed");
            }
            self.registry.apply_probe(&id, outcome);
        });
        join_all(probes).await;
    }

    /// Probe one backend's load endpoint. A reachable endpoint that omits
    /// `gpu_utilization` is still healthy; its load is left unchanged.
    async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        let uri: Uri = match format!("http://{endpoint}/metrics/load").parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Invalid probe endpoint");
                return ProbeOutcome { ok: false, load: None };
            }
        };
        let request = match Request::builder().uri(uri).body(Full::new(Bytes::new())) {
            Ok(r) => r,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Failed to build probe request");
                return ProbeOutcome { ok: false, load: None };
            }
        };

        let response =
            match tokio::time::timeout(self.probe_timeout, self.client.request(request)).await {
                Ok(Ok(response)) if response.status().is_success() => response,
                Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                    return ProbeOutcome { ok: false, load: None };
                }
            };

        let load = match tokio::time::timeout(self.probe_timeout, response.into_body().collect())
            .await
        {
            Ok(Ok(collected)) => parse_load(&collected.to_bytes()),
            _ => None,
        };
        ProbeOutcome { ok: true, load }
    }
}

/// Extract `gpu_utilization` from a load-endpoint body, clamped to [0, 1].
fn parse_load(body: &[u8]) -> Option<f64> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    let load = json.get("gpu_utilization")?.as_f64()?;
    if load.is_finite() {
        Some(load.clamp(0.0, 1.0))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load() {
        assert_eq!(parse_load(br#"{"gpu_utilization": 0.73}"#), Some(0.73));
        assert_eq!(
            parse_load(br#"{"gpu_utilization": 0.5, "in_flight": 2, "model_name": "m"}"#),
            Some(0.5)
        );
    }

    #[test]
    fn test_parse_load_clamps() {
        assert_eq!(parse_load(br#"{"gpu_utilization": 1.7}"#), Some(1.0));
        assert_eq!(parse_load(br#"{"gpu_utilization": -0.2}"#), Some(0.0));
    }

    #[test]
    fn test_parse_load_missing_field_tolerated() {
        assert_eq!(parse_load(br#"{"queue_depth": 3}"#), None);
        assert_eq!(parse_load(b"not json"), None);
        assert_eq!(parse_load(br#"{"gpu_utilization": "busy"}"#), None);
    }
}
