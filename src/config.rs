//! Configuration for the proxy.
//!
//! Loaded once from a JSON file and immutable afterwards. Unknown keys are
//! ignored; missing required keys and unknown strategy names fail the load.

use crate::backend::BackendDescriptor;
use crate::selection::Strategy;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy server settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Models served by the backend pool
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Cluster provider settings. Opaque to the proxy: only the endpoint
    /// list derived from `models` reaches the registry.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Header names used for session/task/client tracking
    #[serde(default)]
    pub headers: HeadersConfig,
}

/// Proxy server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Load balancing strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Seconds between health probes of each backend
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_s: u64,

    /// End-to-end request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_s: u64,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u64,

    /// How many alternative candidates to try after an in-band failure
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Default per-backend concurrency cap (None = unlimited)
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Prometheus exporter port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            strategy: Strategy::default(),
            health_check_interval_s: default_health_check_interval(),
            request_timeout_s: default_request_timeout(),
            probe_timeout_s: default_probe_timeout(),
            connect_timeout_s: default_connect_timeout(),
            max_retries: default_max_retries(),
            max_in_flight: None,
            metrics_port: default_metrics_port(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_s)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }
}

/// Configuration for one model and its replica set.
///
/// ```json
/// {
///   "name": "llama",
///   "model_path": "meta-llama/Llama-3.1-8B-Instruct",
///   "base_port": 5900,
///   "replicas": 2
/// }
/// ```
///
/// Replica `i` is expected at `127.0.0.1:{base_port + i}` (endpoints are
/// local addresses, post-tunneling). `tensor_parallel_size` and
/// `gpu_memory_utilization` are launch metadata the proxy carries but never
/// interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model alias clients use in request bodies
    pub name: String,

    /// HuggingFace model path or local path (opaque metadata)
    #[serde(default)]
    pub model_path: String,

    /// Base port for this model's replicas
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Tensor parallelism degree (opaque metadata)
    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: usize,

    /// GPU memory fraction handed to the server (opaque metadata)
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,

    /// Per-backend concurrency cap override
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

/// Cluster provider configuration. The proxy treats everything here as
/// opaque; launchers and tunnels are external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(rename = "type", default = "default_cluster_type")]
    pub kind: String,

    #[serde(default)]
    pub ssh_host: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kind: default_cluster_type(),
            ssh_host: None,
        }
    }
}

/// Configurable header names for request tracking. Different projects use
/// different names; these defaults match the client SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersConfig {
    #[serde(default = "default_session_header")]
    pub session: String,

    #[serde(default = "default_task_header")]
    pub task: String,

    #[serde(default = "default_client_header")]
    pub client: String,

    #[serde(default = "default_timing_pre_header")]
    pub timing_pre: String,

    #[serde(default = "default_timing_post_header")]
    pub timing_post: String,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            session: default_session_header(),
            task: default_task_header(),
            client: default_client_header(),
            timing_pre: default_timing_pre_header(),
            timing_post: default_timing_post_header(),
        }
    }
}

fn default_port() -> u16 {
    5800
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_retries() -> usize {
    1
}

fn default_base_port() -> u16 {
    5900
}

fn default_replicas() -> usize {
    1
}

fn default_tensor_parallel_size() -> usize {
    1
}

fn default_gpu_memory_utilization() -> f64 {
    0.85
}

fn default_cluster_type() -> String {
    "local".to_string()
}

fn default_session_header() -> String {
    "X-Session-ID".to_string()
}

fn default_task_header() -> String {
    "X-Task-ID".to_string()
}

fn default_client_header() -> String {
    "X-Client-ID".to_string()
}

fn default_timing_pre_header() -> String {
    "X-Timing-Pre-Ms".to_string()
}

fn default_timing_post_header() -> String {
    "X-Timing-Post-Ms".to_string()
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Initial backend descriptors derived from the model list: one entry
    /// per replica at `127.0.0.1:{base_port + i}`.
    pub fn initial_backends(&self) -> Vec<BackendDescriptor> {
        let mut out = Vec::new();
        for model in &self.models {
            for replica in 0..model.replicas {
                out.push(BackendDescriptor {
                    id: format!("{}-{}", model.name, replica),
                    model_name: model.name.clone(),
                    endpoint: format!("127.0.0.1:{}", model.base_port + replica as u16),
                    max_in_flight: model.max_in_flight.or(self.proxy.max_in_flight),
                });
            }
        }
        out
    }
}

/// Parse standalone backend specs of the form `model=host:port,host:port`.
///
/// Used by the `--backend` CLI flag to seed the registry without a config
/// file. Replica indices are assigned in listing order per model.
pub fn parse_backends(specs: &[String]) -> Result<Vec<BackendDescriptor>> {
    let mut by_model: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for spec in specs {
        let Some((model, endpoints)) = spec.split_once('=') else {
            bail!("invalid backend spec (expected 'model=host:port,...'): {spec}");
        };
        for endpoint in endpoints.split(',') {
            let Some((_, port)) = endpoint.rsplit_once(':') else {
                bail!("invalid endpoint (expected 'host:port'): {endpoint}");
            };
            port.parse::<u16>()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            by_model
                .entry(model.to_string())
                .or_default()
                .push(endpoint.to_string());
        }
    }

    let mut out = Vec::new();
    for (model, endpoints) in by_model {
        for (replica, endpoint) in endpoints.into_iter().enumerate() {
            out.push(BackendDescriptor {
                id: format!("{model}-{replica}"),
                model_name: model.clone(),
                endpoint,
                max_in_flight: None,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "proxy": {
                "port": 8000,
                "strategy": "round_robin",
                "request_timeout_s": 60
            },
            "models": [
                {"name": "llama", "model_path": "meta-llama/Llama-3.1-8B", "base_port": 5900, "replicas": 2},
                {"name": "qwen", "base_port": 6000}
            ]
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.proxy.port, 8000);
        assert_eq!(config.proxy.strategy, Strategy::RoundRobin);
        assert_eq!(config.proxy.request_timeout_s, 60);
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[1].replicas, 1);
        assert_eq!(config.headers.session, "X-Session-ID");
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.proxy.port, 5800);
        assert_eq!(config.proxy.strategy, Strategy::LeastLoad);
        assert_eq!(config.proxy.health_check_interval_s, 30);
        assert_eq!(config.proxy.probe_timeout_s, 3);
        assert_eq!(config.proxy.connect_timeout_s, 5);
        assert_eq!(config.proxy.max_retries, 1);
        assert!(config.proxy.max_in_flight.is_none());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let json = r#"{"proxy": {"port": 8000, "shiny_new_knob": true}, "launcher": {}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.proxy.port, 8000);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let json = r#"{"proxy": {"strategy": "fastest_first"}}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_missing_model_name_rejected() {
        let json = r#"{"models": [{"base_port": 5900}]}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_initial_backends() {
        let json = r#"{
            "proxy": {"max_in_flight": 8},
            "models": [{"name": "llama", "base_port": 5900, "replicas": 3, "max_in_flight": 4}]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let backends = config.initial_backends();
        assert_eq!(backends.len(), 3);
        assert_eq!(backends[0].id, "llama-0");
        assert_eq!(backends[2].endpoint, "127.0.0.1:5902");
        assert_eq!(backends[0].max_in_flight, Some(4));
    }

    #[test]
    fn test_parse_backend_specs() {
        let specs = vec!["llama=gpu1:5900,gpu2:5900".to_string(), "qwen=gpu3:6000".to_string()];
        let backends = parse_backends(&specs).unwrap();
        assert_eq!(backends.len(), 3);
        assert_eq!(backends[0].id, "llama-0");
        assert_eq!(backends[0].endpoint, "gpu1:5900");
        assert_eq!(backends[1].id, "llama-1");
        assert_eq!(backends[2].model_name, "qwen");
    }

    #[test]
    fn test_parse_backend_spec_invalid() {
        assert!(parse_backends(&["no-equals".to_string()]).is_err());
        assert!(parse_backends(&["m=host:notaport".to_string()]).is_err());
    }
}
