//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works
/// — the `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Request path --
    describe_counter!("agent_proxy_requests_total", "Total requests accepted");
    describe_counter!(
        "agent_proxy_turns_total",
        "Finished turns by model and outcome (ok/failed/cancelled)"
    );
    describe_counter!(
        "agent_proxy_errors_total",
        "Requests rejected before dispatch, by error kind"
    );
    describe_counter!(
        "agent_proxy_retries_total",
        "Failover retries onto a different backend"
    );
    describe_histogram!(
        "agent_proxy_request_duration_seconds",
        "End-to-end request duration, acceptance to last relayed byte"
    );

    // -- Backend pool --
    describe_gauge!("agent_proxy_in_flight", "Current in-flight requests per backend");
    describe_counter!(
        "agent_proxy_probe_failures_total",
        "Health probe failures per backend"
    );

    // -- Telemetry store --
    describe_gauge!("agent_proxy_sessions", "Sessions currently tracked");
}
