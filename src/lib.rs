//! # agent-infra-proxy
//!
//! Load-balancing reverse proxy for a pool of GPU-backed, OpenAI-compatible
//! inference replicas serving multi-turn agent workloads. Cluster launchers
//! and SSH tunnels are external collaborators: this crate sees a list of
//! locally reachable endpoints, keeps their health fresh, routes requests,
//! and records per-session timing telemetry for bottleneck diagnosis.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    agent-infra-proxy                     │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Forwarder (axum ingress)                           │  │
//! │  │ - Extracts model + routing context from request    │  │
//! │  │ - Selects a backend (strategy-driven)              │  │
//! │  │ - Relays the byte stream, retries on failover      │  │
//! │  │ - Emits a turn record per request                  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │            │                             │               │
//! │  ┌───────────────────────┐   ┌────────────────────────┐  │
//! │  │ Backend Registry      │   │ Session/Turn Store     │  │
//! │  │ - health, load, EMA   │   │ - per-session rings    │  │
//! │  │ - in-flight tokens    │   │ - bottleneck report    │  │
//! │  │ - change fan-out      │   │ - idle eviction        │  │
//! │  └───────────────────────┘   └────────────────────────┘  │
//! │            ▲                             ▲               │
//! │     Health Monitor                 /admin/* (dashboard)  │
//! │            │                                             │
//! │      ┌─────┼────────────┬──────────────┐                 │
//! │      ▼     ▼            ▼              ▼                 │
//! │  [backend:5900]    [backend:5901]  [backend:6000]        │
//! │   /v1/* · /health · /metrics/load                        │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod backend;
pub mod config;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod selection;
pub mod sessions;
pub mod telemetry;
pub mod types;
pub mod window;

pub use backend::{BackendDescriptor, BackendSnapshot, BackendState, ProbeOutcome};
pub use config::{Config, HeadersConfig, ModelConfig, ProxyConfig, parse_backends};
pub use health::HealthMonitor;
pub use proxy::{ProxyState, proxy_router};
pub use registry::{BackendRegistry, InFlightToken, RegistryEvent};
pub use selection::{Selector, Strategy};
pub use sessions::{BottleneckReport, SessionStore, TurnRecord};
pub use types::{ErrorKind, ProxyError, RoutingContext};

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tracing::info;

/// Fully wired application: the ingress router plus handles to the shared
/// state, for tests and the binary.
pub struct App {
    pub router: Router,
    pub registry: Arc<BackendRegistry>,
    pub sessions: Arc<SessionStore>,
    pub state: ProxyState,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl App {
    /// Abort background tasks (health probing, session eviction).
    pub fn shutdown(&self) {
        for task in &self.background {
            task.abort();
        }
    }
}

/// Build the complete proxy stack from a config: registry seeded with the
/// configured replicas, health monitor and session sweeper running, proxy
/// and admin routes merged on one router.
pub async fn build_app(config: Config) -> Result<App> {
    build_app_with_backends(config.clone(), config.initial_backends()).await
}

/// Like [`build_app`], but with an explicit backend seed (used by the
/// `--backend` CLI flag and by tests).
pub async fn build_app_with_backends(
    config: Config,
    backends: Vec<BackendDescriptor>,
) -> Result<App> {
    info!(
        backends = backends.len(),
        strategy = config.proxy.strategy.as_str(),
        "Building proxy"
    );

    let registry = Arc::new(BackendRegistry::seed(backends));
    let sessions = Arc::new(SessionStore::default());
    let selector = Arc::new(Selector::new(config.proxy.strategy));

    let state = ProxyState::new(
        &config.proxy,
        config.headers.clone(),
        Arc::clone(&registry),
        selector,
        Arc::clone(&sessions),
    );

    let monitor = HealthMonitor::new(
        Arc::clone(&registry),
        config.proxy.health_check_interval(),
        config.proxy.probe_timeout(),
    );
    let background = vec![monitor.spawn(), Arc::clone(&sessions).spawn_sweeper()];

    let router = proxy_router(state.clone()).merge(admin::admin_router(state.clone()));

    Ok(App {
        router,
        registry,
        sessions,
        state,
        background,
    })
}
