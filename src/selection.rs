//! Backend selection strategies.
//!
//! The strategy is a config-time tag; [`Selector::select`] maps a registry
//! snapshot to a backend id. All strategies are deterministic given
//! identical snapshots and counter states, and never mutate the registry:
//! the in-flight increment happens in the forwarder via `observe_start`.

use crate::backend::BackendSnapshot;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Composite weights for the `least_load` score.
const LOAD_WEIGHT: f64 = 0.6;
const IN_FLIGHT_WEIGHT: f64 = 0.3;
const LATENCY_WEIGHT: f64 = 0.1;
const NORM_EPSILON: f64 = 1e-9;

/// Load balancing strategy. Unknown names are rejected when the config is
/// deserialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Per-model monotonic counter over the candidate list
    RoundRobin,
    /// Fewest outstanding requests; ties by EMA latency, then id
    LeastConnections,
    /// Lowest EMA latency (unknown treated as +inf); ties by in-flight, then id
    LeastLatency,
    /// Composite of GPU load, in-flight, and latency
    #[default]
    LeastLoad,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::LeastLatency => "least_latency",
            Strategy::LeastLoad => "least_load",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "least_latency" => Ok(Strategy::LeastLatency),
            "least_load" => Ok(Strategy::LeastLoad),
            other => Err(format!(
                "unknown strategy '{other}' (expected round_robin, least_connections, least_latency, or least_load)"
            )),
        }
    }
}

/// Maps a model's candidate snapshot to a backend.
pub struct Selector {
    strategy: Strategy,
    /// Per-model round-robin cursors. Every call advances the cursor;
    /// skipped candidates are not re-tried.
    cursors: DashMap<String, AtomicU64>,
}

impl Selector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Choose a backend from `candidates` (sorted by id, as returned by
    /// `list_for_model`). The session id is an affinity hint accepted for
    /// future use; no current strategy consults it. Returns `None` when the
    /// candidate set is empty.
    pub fn select(
        &self,
        model: &str,
        candidates: &[BackendSnapshot],
        _session_hint: Option<&str>,
    ) -> Option<BackendSnapshot> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.strategy {
            Strategy::RoundRobin => self.next_cursor(model) as usize % candidates.len(),
            Strategy::LeastConnections => least_connections(candidates),
            Strategy::LeastLatency => least_latency(candidates),
            Strategy::LeastLoad => least_load(candidates),
        };
        Some(candidates[index].clone())
    }

    fn next_cursor(&self, model: &str) -> u64 {
        self.cursors
            .entry(model.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// EMA with NaN mapped to +inf so unprobed backends sort last.
fn ema_or_inf(snapshot: &BackendSnapshot) -> f64 {
    if snapshot.ema_latency_ms.is_nan() {
        f64::INFINITY
    } else {
        snapshot.ema_latency_ms
    }
}

fn least_connections(candidates: &[BackendSnapshot]) -> usize {
    argmin_by(candidates, |b| (b.in_flight as f64, ema_or_inf(b)))
}

fn least_latency(candidates: &[BackendSnapshot]) -> usize {
    argmin_by(candidates, |b| (ema_or_inf(b), b.in_flight as f64))
}

fn least_load(candidates: &[BackendSnapshot]) -> usize {
    let known: Vec<f64> = candidates
        .iter()
        .map(|b| b.load)
        .filter(|l| !l.is_nan())
        .collect();
    // Without any load report the composite degenerates; fall back to
    // connection counting.
    if known.is_empty() {
        return least_connections(candidates);
    }
    let mean_load = known.iter().sum::<f64>() / known.len() as f64;
    let load_of = |b: &BackendSnapshot| if b.load.is_nan() { mean_load } else { b.load };

    // An unmeasured backend must not score as the fastest; give it the
    // worst observed EMA, consistent with least_latency sorting unknowns
    // last. With no measurements at all the latency term cancels out.
    let max_ema = candidates
        .iter()
        .map(|b| b.ema_latency_ms)
        .filter(|e| !e.is_nan())
        .fold(0.0_f64, f64::max);
    let ema_of = |b: &BackendSnapshot| {
        if b.ema_latency_ms.is_nan() {
            max_ema
        } else {
            b.ema_latency_ms
        }
    };

    let max_in_flight = candidates
        .iter()
        .map(|b| b.in_flight as f64)
        .fold(0.0_f64, f64::max);

    // Load is already in [0, 1] and enters the score raw; only in-flight
    // and latency are normalized against the candidate maxima.
    let normalize = |x: f64, max: f64| x / (max + NORM_EPSILON);
    argmin_by(candidates, |b| {
        let score = LOAD_WEIGHT * load_of(b)
            + IN_FLIGHT_WEIGHT * normalize(b.in_flight as f64, max_in_flight)
            + LATENCY_WEIGHT * normalize(ema_of(b), max_ema);
        (score, 0.0)
    })
}

/// Index of the candidate minimizing `key`; ties resolved by the list
/// order, which is id order.
fn argmin_by<F>(candidates: &[BackendSnapshot], key: F) -> usize
where
    F: Fn(&BackendSnapshot) -> (f64, f64),
{
    let mut best = 0;
    let mut best_key = key(&candidates[0]);
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        let k = key(candidate);
        if k.0 < best_key.0 || (k.0 == best_key.0 && k.1 < best_key.1) {
            best = i;
            best_key = k;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;

    fn snapshot(id: &str, in_flight: usize, load: f64, ema: f64) -> BackendSnapshot {
        BackendSnapshot {
            id: id.to_string(),
            model_name: "m".to_string(),
            endpoint: "127.0.0.1:5900".to_string(),
            state: BackendState::Healthy,
            in_flight,
            load,
            ema_latency_ms: ema,
            consecutive_failures: 0,
            max_in_flight: None,
            last_probe_at_ms: None,
            last_ok_at_ms: None,
        }
    }

    #[test]
    fn test_empty_candidates() {
        let selector = Selector::new(Strategy::RoundRobin);
        assert!(selector.select("m", &[], None).is_none());
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = Selector::new(Strategy::RoundRobin);
        let candidates = vec![
            snapshot("m-0", 0, 0.1, 10.0),
            snapshot("m-1", 0, 0.1, 10.0),
            snapshot("m-2", 0, 0.1, 10.0),
        ];
        let picks: Vec<String> = (0..6)
            .map(|_| selector.select("m", &candidates, None).unwrap().id)
            .collect();
        assert_eq!(picks, vec!["m-0", "m-1", "m-2", "m-0", "m-1", "m-2"]);
    }

    #[test]
    fn test_round_robin_counters_are_per_model() {
        let selector = Selector::new(Strategy::RoundRobin);
        let m = vec![snapshot("m-0", 0, 0.0, 0.0), snapshot("m-1", 0, 0.0, 0.0)];
        let q = vec![snapshot("q-0", 0, 0.0, 0.0), snapshot("q-1", 0, 0.0, 0.0)];

        assert_eq!(selector.select("m", &m, None).unwrap().id, "m-0");
        assert_eq!(selector.select("q", &q, None).unwrap().id, "q-0");
        assert_eq!(selector.select("m", &m, None).unwrap().id, "m-1");
    }

    #[test]
    fn test_least_connections_with_tie_breaks() {
        let selector = Selector::new(Strategy::LeastConnections);
        let candidates = vec![
            snapshot("m-0", 2, 0.1, 50.0),
            snapshot("m-1", 1, 0.1, 80.0),
            snapshot("m-2", 1, 0.1, 40.0),
        ];
        // m-1 and m-2 tie on in-flight; m-2 wins on lower EMA
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-2");
    }

    #[test]
    fn test_least_connections_equal_metrics_picks_lowest_id() {
        let selector = Selector::new(Strategy::LeastConnections);
        let candidates = vec![snapshot("m-0", 1, 0.1, 50.0), snapshot("m-1", 1, 0.1, 50.0)];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-0");
    }

    #[test]
    fn test_least_latency_nan_sorts_last() {
        let selector = Selector::new(Strategy::LeastLatency);
        let candidates = vec![
            snapshot("m-0", 0, 0.1, f64::NAN),
            snapshot("m-1", 3, 0.1, 90.0),
        ];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-1");
    }

    #[test]
    fn test_least_load_composite() {
        let selector = Selector::new(Strategy::LeastLoad);
        let candidates = vec![
            snapshot("m-0", 1, 0.9, 100.0),
            snapshot("m-1", 5, 0.2, 120.0),
            snapshot("m-2", 0, 0.5, 80.0),
        ];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-2");
    }

    #[test]
    fn test_least_load_applies_load_raw() {
        let selector = Selector::new(Strategy::LeastLoad);
        // Normalizing load against the candidate max would score these as a
        // tie (both 0.6) and wrongly pick m-0; with the raw load term the
        // scores are 0.36 vs 0.12 and the idle backend wins.
        let candidates = vec![
            snapshot("m-0", 10, 0.1, 0.0),
            snapshot("m-1", 0, 0.2, 0.0),
        ];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-1");
    }

    #[test]
    fn test_least_load_unknown_ema_not_favored() {
        let selector = Selector::new(Strategy::LeastLoad);
        // Equal load and in-flight: the unmeasured backend takes the worst
        // observed EMA, so the backend with the best measurement wins.
        let candidates = vec![
            snapshot("m-0", 0, 0.5, f64::NAN),
            snapshot("m-1", 0, 0.5, 40.0),
            snapshot("m-2", 0, 0.5, 80.0),
        ];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-1");
    }

    #[test]
    fn test_least_load_nan_uses_mean_of_known() {
        let selector = Selector::new(Strategy::LeastLoad);
        // m-1's unknown load becomes the mean (0.5), worse than m-0's 0.1
        let candidates = vec![
            snapshot("m-0", 0, 0.1, 50.0),
            snapshot("m-1", 0, f64::NAN, 50.0),
            snapshot("m-2", 0, 0.9, 50.0),
        ];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-0");
    }

    #[test]
    fn test_least_load_all_nan_falls_back_to_connections() {
        let selector = Selector::new(Strategy::LeastLoad);
        let candidates = vec![
            snapshot("m-0", 4, f64::NAN, 50.0),
            snapshot("m-1", 1, f64::NAN, 50.0),
        ];
        assert_eq!(selector.select("m", &candidates, None).unwrap().id, "m-1");
    }

    #[test]
    fn test_determinism() {
        let selector = Selector::new(Strategy::LeastLoad);
        let candidates = vec![
            snapshot("m-0", 1, 0.9, 100.0),
            snapshot("m-1", 5, 0.2, 120.0),
            snapshot("m-2", 0, 0.5, 80.0),
        ];
        let first = selector.select("m", &candidates, None).unwrap().id;
        for _ in 0..20 {
            assert_eq!(selector.select("m", &candidates, None).unwrap().id, first);
        }
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let s: Strategy = serde_json::from_str("\"least_connections\"").unwrap();
        assert_eq!(s, Strategy::LeastConnections);
        assert!(serde_json::from_str::<Strategy>("\"weighted\"").is_err());
    }
}
