//! agent-infra-proxy - load-balancing front-end for GPU inference pools.
//!
//! Accepts OpenAI-compatible chat-completions traffic, routes each request
//! to a healthy backend replica, and serves aggregated health/load/timing
//! data under `/admin/` for the terminal dashboard.

use agent_infra_proxy::{Config, Strategy, parse_backends};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes: 0 clean shutdown, 2 config error, 3 bind failure,
/// 130 interrupted.
const EXIT_CONFIG: i32 = 2;
const EXIT_BIND: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "agent-infra-proxy")]
#[command(about = "Load-balancing reverse proxy for LLM inference backends")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Load balancing strategy (overrides config)
    #[arg(short, long)]
    strategy: Option<Strategy>,

    /// Standalone backend specs: 'model=host:port,host:port' (repeatable).
    /// When given, the config file is optional.
    #[arg(long = "backend")]
    backends: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("agent_infra_proxy=debug")
    } else {
        EnvFilter::try_from_env("AGENT_INFRA_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting agent-infra-proxy");

    // Load configuration. With --backend specs the file is optional.
    let mut config = if !args.config.exists() && !args.backends.is_empty() {
        Config::default()
    } else {
        match Config::from_file(&args.config).await {
            Ok(config) => config,
            Err(e) => {
                error!(path = %args.config.display(), error = %e, "Configuration error");
                return EXIT_CONFIG;
            }
        }
    };

    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    if let Some(strategy) = args.strategy {
        config.proxy.strategy = strategy;
    }

    let seeds = if args.backends.is_empty() {
        config.initial_backends()
    } else {
        match parse_backends(&args.backends) {
            Ok(seeds) => seeds,
            Err(e) => {
                error!(error = %e, "Invalid --backend spec");
                return EXIT_CONFIG;
            }
        }
    };

    if seeds.is_empty() {
        error!(
            path = %args.config.display(),
            "No backends configured: add a 'models' section or pass --backend"
        );
        return EXIT_CONFIG;
    }

    info!(
        models = ?seeds.iter().map(|b| b.model_name.as_str()).collect::<Vec<_>>(),
        port = config.proxy.port,
        strategy = config.proxy.strategy.as_str(),
        "Configuration loaded"
    );

    // Prometheus exporter on its own port, if enabled.
    if config.proxy.metrics_port != 0
        && let Some(handle) = agent_infra_proxy::telemetry::install()
    {
        let metrics_addr = format!("0.0.0.0:{}", config.proxy.metrics_port);
        let metrics_listener = match TcpListener::bind(&metrics_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %metrics_addr, error = %e, "Failed to bind metrics port");
                return EXIT_BIND;
            }
        };
        info!(addr = %metrics_addr, "Serving metrics");
        let metrics_router = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let app = match agent_infra_proxy::build_app_with_backends(config.clone(), seeds).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Failed to build application");
            return EXIT_CONFIG;
        }
    };

    let addr = format!("0.0.0.0:{}", config.proxy.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind");
            return EXIT_BIND;
        }
    };

    info!(addr = %addr, "Listening for requests");
    info!("Agents: export OPENAI_BASE_URL=http://localhost:{}/v1", config.proxy.port);

    let interrupted = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&interrupted);
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received; draining");
        shutdown_flag.store(true, Ordering::SeqCst);
    };

    let served = axum::serve(listener, app.router.clone())
        .with_graceful_shutdown(shutdown)
        .await;
    app.shutdown();

    match served {
        Ok(()) if interrupted.load(Ordering::SeqCst) => EXIT_INTERRUPTED,
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Server error");
            1
        }
    }
}
