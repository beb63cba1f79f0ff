//! Backend value objects: descriptors, health state, and per-backend
//! latency/load statistics.

use crate::window::Ring;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Latency window capacity (completed-request durations, newest last).
pub const LATENCY_WINDOW: usize = 64;

/// Smoothing factor for the latency EMA.
pub const EMA_ALPHA: f64 = 0.2;

/// Probe failures required to transition `Healthy` -> `Unhealthy`.
pub const UNHEALTHY_AFTER: u32 = 3;

/// Endpoint-level identity of a backend, as supplied by the cluster
/// collaborator (or the config seed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Stable id, `{model_name}-{replica_index}`
    pub id: String,
    /// Logical model name clients address
    pub model_name: String,
    /// Locally reachable `host:port`, post-tunneling
    pub endpoint: String,
    /// Optional concurrency cap; at the cap the backend leaves the
    /// candidate set until in-flight drains
    pub max_in_flight: Option<usize>,
}

/// Observed health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Not yet probed; selectable so cold traffic can flow during bootstrap
    Unknown,
    Healthy,
    Unhealthy,
    /// Graceful decommission: finishes in-flight work, receives no new requests
    Draining,
    /// Tombstone; the entry is freed once in-flight drains
    Removed,
}

impl BackendState {
    /// Whether the selection engine may route to this backend.
    pub fn selectable(self) -> bool {
        matches!(self, BackendState::Unknown | BackendState::Healthy)
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub ok: bool,
    /// GPU utilization in [0, 1] if the load endpoint reported one
    pub load: Option<f64>,
}

/// Mutable statistics guarded by the registry's per-backend lock.
#[derive(Debug)]
pub struct BackendStats {
    pub state: BackendState,
    /// Most recent reported GPU utilization, NaN when unknown
    pub load: f64,
    pub latency_window: Ring<f64>,
    /// NaN until the first completed request
    pub ema_latency_ms: f64,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<SystemTime>,
    pub last_ok_at: Option<SystemTime>,
}

impl Default for BackendStats {
    fn default() -> Self {
        Self {
            state: BackendState::Unknown,
            load: f64::NAN,
            latency_window: Ring::new(LATENCY_WINDOW),
            ema_latency_ms: f64::NAN,
            consecutive_failures: 0,
            last_probe_at: None,
            last_ok_at: None,
        }
    }
}

impl BackendStats {
    /// Fold a completed-request latency sample into the window and EMA.
    pub fn record_latency(&mut self, latency_ms: f64) {
        self.latency_window.push(latency_ms);
        self.ema_latency_ms = if self.ema_latency_ms.is_nan() {
            latency_ms
        } else {
            EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.ema_latency_ms
        };
    }

    /// Register a failure (probe or in-band). Returns the new state if the
    /// failure caused a transition.
    pub fn record_failure(&mut self) -> Option<BackendState> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER
            && matches!(self.state, BackendState::Healthy | BackendState::Unknown)
        {
            self.state = BackendState::Unhealthy;
            return Some(BackendState::Unhealthy);
        }
        None
    }

    /// Register a success. Returns the new state if the success caused a
    /// transition (`Unknown`/`Unhealthy` -> `Healthy`).
    pub fn record_success(&mut self) -> Option<BackendState> {
        self.consecutive_failures = 0;
        if matches!(self.state, BackendState::Unknown | BackendState::Unhealthy) {
            self.state = BackendState::Healthy;
            return Some(BackendState::Healthy);
        }
        None
    }
}

/// Immutable point-in-time view of a backend, used by selection and the
/// admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub model_name: String,
    pub endpoint: String,
    pub state: BackendState,
    pub in_flight: usize,
    /// NaN (serialized as null) when the load is unknown
    pub load: f64,
    /// NaN (serialized as null) until the first completed request
    pub ema_latency_ms: f64,
    pub consecutive_failures: u32,
    pub max_in_flight: Option<usize>,
    pub last_probe_at_ms: Option<u64>,
    pub last_ok_at_ms: Option<u64>,
}

pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_starts_at_first_sample() {
        let mut stats = BackendStats::default();
        assert!(stats.ema_latency_ms.is_nan());
        stats.record_latency(100.0);
        assert_eq!(stats.ema_latency_ms, 100.0);
        stats.record_latency(200.0);
        assert!((stats.ema_latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_window_bounded() {
        let mut stats = BackendStats::default();
        for i in 0..(LATENCY_WINDOW + 10) {
            stats.record_latency(i as f64);
        }
        assert_eq!(stats.latency_window.len(), LATENCY_WINDOW);
    }

    #[test]
    fn test_unhealthy_after_three_failures() {
        let mut stats = BackendStats {
            state: BackendState::Healthy,
            ..BackendStats::default()
        };
        assert_eq!(stats.record_failure(), None);
        assert_eq!(stats.record_failure(), None);
        assert_eq!(stats.record_failure(), Some(BackendState::Unhealthy));
        assert_eq!(stats.state, BackendState::Unhealthy);
    }

    #[test]
    fn test_single_success_recovers() {
        let mut stats = BackendStats {
            state: BackendState::Unhealthy,
            consecutive_failures: 5,
            ..BackendStats::default()
        };
        assert_eq!(stats.record_success(), Some(BackendState::Healthy));
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn test_healthy_implies_zero_failures() {
        let mut stats = BackendStats::default();
        stats.record_failure();
        stats.record_success();
        assert_eq!(stats.state, BackendState::Healthy);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn test_draining_not_selectable() {
        assert!(BackendState::Unknown.selectable());
        assert!(BackendState::Healthy.selectable());
        assert!(!BackendState::Unhealthy.selectable());
        assert!(!BackendState::Draining.selectable());
        assert!(!BackendState::Removed.selectable());
    }

    #[test]
    fn test_failure_does_not_resurrect_draining() {
        let mut stats = BackendStats {
            state: BackendState::Draining,
            ..BackendStats::default()
        };
        for _ in 0..5 {
            stats.record_failure();
        }
        assert_eq!(stats.state, BackendState::Draining);
    }
}
