//! Per-session turn telemetry: rolling rings of timing records plus the
//! aggregation behind the bottleneck report.
//!
//! Writes happen once per completed request and never fail the request.
//! Reads come from the admin surface. Sessions use per-entry locking via
//! the map; the global window sits behind one coarse mutex.

use crate::types::ErrorKind;
use crate::window::Ring;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Per-session ring capacity.
pub const SESSION_TURNS: usize = 128;

/// Global rolling window capacity.
pub const GLOBAL_TURNS: usize = 4096;

/// Idle time after which a session becomes eligible for eviction.
pub const SESSION_EXPIRE: Duration = Duration::from_secs(30 * 60);

/// Eviction sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Throughput window for `requests_per_s`.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// GPU load above which an inference-bound pipeline suggests scaling out.
const SATURATION_LOAD: f64 = 0.85;

/// One request/response cycle, finalized on completion or failure.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub session_id: String,
    pub task_id: String,
    pub client_id: String,
    pub model_name: String,
    pub backend_id: String,
    /// Request acceptance to upstream connect
    pub queue_wait_ms: f64,
    /// First upstream byte sent to last byte received
    pub inference_ms: f64,
    /// Agent-reported pre-request time (header)
    pub pre_ms: f64,
    /// Agent-reported post-request time (header)
    pub post_ms: f64,
    pub total_ms: f64,
    pub status_code: u16,
    pub streamed: bool,
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock acceptance time, unix millis
    pub started_at_ms: u64,
}

struct SessionEntry {
    turns: Ring<TurnRecord>,
    first_seen_ms: u64,
    last_seen_ms: u64,
    /// Cumulative count; survives ring wraparound
    total_turns: u64,
}

/// Summary row for the dashboard session list.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// Turns currently retained in the ring
    pub turns: usize,
    /// Turns ever recorded for this session
    pub total_turns: u64,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub model_name: String,
    pub client_id: String,
}

/// Mean and p95 of one pipeline stage, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageStats {
    pub mean_ms: f64,
    pub p95_ms: f64,
}

/// Where the end-to-end time of a scope is going.
#[derive(Debug, Clone, Serialize)]
pub struct BottleneckReport {
    /// "global" or the session id
    pub scope: String,
    pub turns: usize,
    pub pre: StageStats,
    pub queue_wait: StageStats,
    pub inference: StageStats,
    pub post: StageStats,
    pub total_mean_ms: f64,
    pub mean_backend_load: f64,
    /// Stage whose mean exceeds half the total mean, if any
    pub dominant: Option<String>,
    pub suggestion: String,
}

/// Global throughput numbers for `/admin/queue`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Throughput {
    pub requests_per_s: f64,
    pub mean_latency_ms: f64,
}

/// Rolling store of turn records keyed by session.
pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    global: Mutex<Ring<TurnRecord>>,
    completed_at: Mutex<VecDeque<Instant>>,
    session_capacity: usize,
    expire_after: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TURNS, GLOBAL_TURNS, SESSION_EXPIRE)
    }
}

impl SessionStore {
    pub fn new(session_capacity: usize, global_capacity: usize, expire_after: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            global: Mutex::new(Ring::new(global_capacity)),
            completed_at: Mutex::new(VecDeque::new()),
            session_capacity,
            expire_after,
        }
    }

    /// Append a finalized turn to the global window and, when the turn
    /// carries a session id, to that session's ring.
    pub fn record(&self, turn: TurnRecord) {
        {
            let mut completed = self.completed_at.lock().expect("throughput lock");
            completed.push_back(Instant::now());
            prune_window(&mut completed);
        }
        {
            let mut global = self.global.lock().expect("global window lock");
            global.push(turn.clone());
        }
        if turn.session_id.is_empty() {
            return;
        }

        let now_ms = now_millis();
        let mut entry = self
            .sessions
            .entry(turn.session_id.clone())
            .or_insert_with(|| SessionEntry {
                turns: Ring::new(self.session_capacity),
                first_seen_ms: now_ms,
                last_seen_ms: now_ms,
                total_turns: 0,
            });
        entry.turns.push(turn);
        entry.last_seen_ms = now_ms;
        entry.total_turns += 1;
    }

    /// Retained turns for one session, oldest first.
    pub fn get_session(&self, session_id: &str) -> Option<Vec<TurnRecord>> {
        self.sessions.get(session_id).map(|e| e.turns.to_vec())
    }

    /// Session summaries sorted by `last_seen` descending. `since_ms`
    /// filters out sessions idle since before the given unix-millis instant.
    pub fn list_sessions(&self, limit: usize, since_ms: Option<u64>) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|e| since_ms.is_none_or(|since| e.last_seen_ms >= since))
            .map(|e| {
                let last = e.turns.iter().last();
                SessionSummary {
                    session_id: e.key().clone(),
                    turns: e.turns.len(),
                    total_turns: e.total_turns,
                    first_seen_ms: e.first_seen_ms,
                    last_seen_ms: e.last_seen_ms,
                    model_name: last.map(|t| t.model_name.clone()).unwrap_or_default(),
                    client_id: last.map(|t| t.client_id.clone()).unwrap_or_default(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        summaries.truncate(limit);
        summaries
    }

    /// Number of tracked sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 1-minute rolling throughput and the mean end-to-end latency over the
    /// global window.
    pub fn throughput(&self) -> Throughput {
        let requests_per_s = {
            let mut completed = self.completed_at.lock().expect("throughput lock");
            prune_window(&mut completed);
            completed.len() as f64 / THROUGHPUT_WINDOW.as_secs_f64()
        };
        let mean_latency_ms = {
            let global = self.global.lock().expect("global window lock");
            mean(global.iter().map(|t| t.total_ms))
        };
        Throughput {
            requests_per_s,
            mean_latency_ms,
        }
    }

    /// Classify which pipeline stage dominates end-to-end latency over the
    /// requested scope. Returns `None` for an unknown session id.
    pub fn bottleneck_report(
        &self,
        session_id: Option<&str>,
        mean_backend_load: f64,
    ) -> Option<BottleneckReport> {
        let (scope, turns) = match session_id {
            Some(id) => (id.to_string(), self.get_session(id)?),
            None => ("global".to_string(), {
                let global = self.global.lock().expect("global window lock");
                global.to_vec()
            }),
        };

        let pre = stage_stats(&turns, |t| t.pre_ms);
        let queue_wait = stage_stats(&turns, |t| t.queue_wait_ms);
        let inference = stage_stats(&turns, |t| t.inference_ms);
        let post = stage_stats(&turns, |t| t.post_ms);
        let total_mean_ms = mean(turns.iter().map(|t| t.total_ms));
        let half_total = total_mean_ms / 2.0;

        let stages = [
            ("pre_ms", pre.mean_ms),
            ("queue_wait_ms", queue_wait.mean_ms),
            ("inference_ms", inference.mean_ms),
            ("post_ms", post.mean_ms),
        ];
        let dominant = stages
            .iter()
            .filter(|(_, m)| !turns.is_empty() && *m > half_total)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name.to_string());

        let suggestion = if inference.mean_ms > half_total
            && !turns.is_empty()
            && mean_backend_load > SATURATION_LOAD
        {
            "increase replicas"
        } else if !turns.is_empty() && pre.mean_ms + post.mean_ms > half_total {
            "agent-bound; increase agent parallelism"
        } else {
            "balanced"
        };

        Some(BottleneckReport {
            scope,
            turns: turns.len(),
            pre,
            queue_wait,
            inference,
            post,
            total_mean_ms,
            mean_backend_load,
            dominant,
            suggestion: suggestion.to_string(),
        })
    }

    /// Drop sessions whose last activity is older than the expiry.
    pub fn evict_idle(&self) {
        let cutoff = now_millis().saturating_sub(self.expire_after.as_millis() as u64);
        let before = self.sessions.len();
        self.sessions.retain(|_, e| e.last_seen_ms >= cutoff);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "Evicted idle sessions");
        }
    }

    /// Spawn the periodic eviction sweep.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                debug!("Session eviction sweep");
                self.evict_idle();
            }
        })
    }
}

fn prune_window(completed: &mut VecDeque<Instant>) {
    let cutoff = Instant::now() - THROUGHPUT_WINDOW;
    while completed.front().is_some_and(|t| *t < cutoff) {
        completed.pop_front();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn stage_stats<F: Fn(&TurnRecord) -> f64>(turns: &[TurnRecord], field: F) -> StageStats {
    let mut values: Vec<f64> = turns.iter().map(&field).collect();
    let mean_ms = mean(values.iter().copied());
    let p95_ms = if values.is_empty() {
        0.0
    } else {
        values.sort_by(f64::total_cmp);
        let rank = ((values.len() as f64) * 0.95).ceil() as usize;
        values[rank.saturating_sub(1)]
    };
    StageStats { mean_ms, p95_ms }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(session: &str, pre: f64, queue: f64, inference: f64, post: f64) -> TurnRecord {
        TurnRecord {
            session_id: session.to_string(),
            task_id: String::new(),
            client_id: String::new(),
            model_name: "m".to_string(),
            backend_id: "m-0".to_string(),
            queue_wait_ms: queue,
            inference_ms: inference,
            pre_ms: pre,
            post_ms: post,
            total_ms: pre + queue + inference + post,
            status_code: 200,
            streamed: false,
            error_kind: None,
            started_at_ms: now_millis(),
        }
    }

    #[test]
    fn test_record_and_get_session() {
        let store = SessionStore::default();
        store.record(turn("s1", 1.0, 2.0, 3.0, 4.0));
        store.record(turn("s1", 1.0, 2.0, 3.0, 4.0));
        store.record(turn("s2", 1.0, 2.0, 3.0, 4.0));

        assert_eq!(store.get_session("s1").unwrap().len(), 2);
        assert_eq!(store.get_session("s2").unwrap().len(), 1);
        assert!(store.get_session("s3").is_none());
    }

    #[test]
    fn test_sessionless_turns_only_hit_global_window() {
        let store = SessionStore::default();
        store.record(turn("", 1.0, 2.0, 3.0, 4.0));
        assert_eq!(store.session_count(), 0);
        let report = store.bottleneck_report(None, 0.0).unwrap();
        assert_eq!(report.turns, 1);
    }

    #[test]
    fn test_session_ring_bounded() {
        let store = SessionStore::new(4, 64, SESSION_EXPIRE);
        for _ in 0..10 {
            store.record(turn("s1", 1.0, 1.0, 1.0, 1.0));
        }
        let turns = store.get_session("s1").unwrap();
        assert_eq!(turns.len(), 4);
        let summary = &store.list_sessions(10, None)[0];
        assert_eq!(summary.turns, 4);
        assert_eq!(summary.total_turns, 10);
    }

    #[test]
    fn test_list_sessions_sorted_by_recency() {
        let store = SessionStore::default();
        store.record(turn("old", 1.0, 1.0, 1.0, 1.0));
        std::thread::sleep(Duration::from_millis(5));
        store.record(turn("new", 1.0, 1.0, 1.0, 1.0));

        let summaries = store.list_sessions(10, None);
        assert_eq!(summaries[0].session_id, "new");
        assert_eq!(summaries[1].session_id, "old");

        let limited = store.list_sessions(1, None);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].session_id, "new");
    }

    #[test]
    fn test_eviction_drops_idle_sessions() {
        let store = SessionStore::new(8, 64, Duration::from_millis(1));
        store.record(turn("s1", 1.0, 1.0, 1.0, 1.0));
        std::thread::sleep(Duration::from_millis(10));
        store.record(turn("s2", 1.0, 1.0, 1.0, 1.0));
        store.evict_idle();

        assert!(store.get_session("s1").is_none());
        assert!(store.get_session("s2").is_some());
    }

    #[test]
    fn test_bottleneck_agent_bound() {
        let store = SessionStore::default();
        for _ in 0..50 {
            store.record(turn("s1", 400.0, 5.0, 200.0, 100.0));
        }
        let report = store.bottleneck_report(None, 0.4).unwrap();
        assert_eq!(report.dominant.as_deref(), Some("pre_ms"));
        assert_eq!(report.suggestion, "agent-bound; increase agent parallelism");
        assert!((report.pre.mean_ms - 400.0).abs() < 1e-9);
        assert!((report.total_mean_ms - 705.0).abs() < 1e-9);
    }

    #[test]
    fn test_bottleneck_inference_bound_saturated() {
        let store = SessionStore::default();
        for _ in 0..10 {
            store.record(turn("s1", 10.0, 5.0, 500.0, 10.0));
        }
        let report = store.bottleneck_report(Some("s1"), 0.9).unwrap();
        assert_eq!(report.dominant.as_deref(), Some("inference_ms"));
        assert_eq!(report.suggestion, "increase replicas");
    }

    #[test]
    fn test_bottleneck_inference_bound_unsaturated_is_balanced() {
        let store = SessionStore::default();
        for _ in 0..10 {
            store.record(turn("s1", 10.0, 5.0, 500.0, 10.0));
        }
        let report = store.bottleneck_report(Some("s1"), 0.3).unwrap();
        assert_eq!(report.suggestion, "balanced");
    }

    #[test]
    fn test_bottleneck_balanced() {
        let store = SessionStore::default();
        for _ in 0..10 {
            store.record(turn("s1", 100.0, 100.0, 100.0, 100.0));
        }
        let report = store.bottleneck_report(None, 0.2).unwrap();
        assert_eq!(report.dominant, None);
        assert_eq!(report.suggestion, "balanced");
    }

    #[test]
    fn test_bottleneck_unknown_session() {
        let store = SessionStore::default();
        assert!(store.bottleneck_report(Some("nope"), 0.0).is_none());
    }

    #[test]
    fn test_p95() {
        let turns: Vec<TurnRecord> = (1..=100)
            .map(|i| turn("s", i as f64, 0.0, 0.0, 0.0))
            .collect();
        let stats = stage_stats(&turns, |t| t.pre_ms);
        assert_eq!(stats.p95_ms, 95.0);
    }

    #[test]
    fn test_throughput_counts_recent_completions() {
        let store = SessionStore::default();
        for _ in 0..6 {
            store.record(turn("s", 0.0, 0.0, 100.0, 0.0));
        }
        let throughput = store.throughput();
        assert!((throughput.requests_per_s - 0.1).abs() < 1e-9);
        assert!((throughput.mean_latency_ms - 100.0).abs() < 1e-9);
    }
}
