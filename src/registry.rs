//! Backend registry: the live inventory of replicas, their observed health,
//! in-flight counts, and rolling latencies.
//!
//! Reads (selection, admin snapshots) never block writes beyond one
//! per-backend field update: the map is a [`DashMap`] keyed by backend id,
//! in-flight counts are atomics, and the remaining statistics sit behind a
//! short per-backend mutex. Operations on different backends never
//! serialize against each other.

use crate::backend::{
    BackendDescriptor, BackendSnapshot, BackendState, BackendStats, ProbeOutcome, unix_millis,
};
use dashmap::DashMap;
use metrics::gauge;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the change-event fan-out. Slow consumers drop events; the
/// dashboard reconstructs full state from snapshot endpoints.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change events emitted to `subscribe()` receivers, in application order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Added { id: String, model_name: String, endpoint: String },
    Removed { id: String },
    StateChanged { id: String, state: BackendState },
    LoadChanged { id: String, load: f64 },
}

struct EntryInner {
    endpoint: String,
    max_in_flight: Option<usize>,
    stats: BackendStats,
}

struct BackendEntry {
    id: String,
    model_name: String,
    in_flight: AtomicUsize,
    inner: Mutex<EntryInner>,
}

impl BackendEntry {
    fn snapshot(&self) -> BackendSnapshot {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let inner = self.inner.lock().expect("backend lock");
        BackendSnapshot {
            id: self.id.clone(),
            model_name: self.model_name.clone(),
            endpoint: inner.endpoint.clone(),
            state: inner.stats.state,
            in_flight,
            load: inner.stats.load,
            ema_latency_ms: inner.stats.ema_latency_ms,
            consecutive_failures: inner.stats.consecutive_failures,
            max_in_flight: inner.max_in_flight,
            last_probe_at_ms: inner.stats.last_probe_at.map(unix_millis),
            last_ok_at_ms: inner.stats.last_ok_at.map(unix_millis),
        }
    }
}

/// Token returned by [`BackendRegistry::observe_start`]; pair every token
/// with exactly one `observe_end` or `observe_cancel`. If a token is
/// dropped unconsumed (a bug upstream), the in-flight count is still
/// released so the registry never leaks capacity.
pub struct InFlightToken {
    entry: Arc<BackendEntry>,
    consumed: bool,
}

impl InFlightToken {
    /// Backend this token belongs to.
    pub fn backend_id(&self) -> &str {
        &self.entry.id
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        if !self.consumed {
            release_in_flight(&self.entry);
        }
    }
}

fn release_in_flight(entry: &BackendEntry) {
    let prev = entry.in_flight.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "in_flight underflow on {}", entry.id);
    gauge!("agent_proxy_in_flight", "backend" => entry.id.clone())
        .set(prev.saturating_sub(1) as f64);
}

/// Process-wide mapping from backend id to backend.
pub struct BackendRegistry {
    backends: DashMap<String, Arc<BackendEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backends: DashMap::new(),
            events,
        }
    }

    /// Seed the registry from an initial descriptor list.
    pub fn seed(descriptors: Vec<BackendDescriptor>) -> Self {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.upsert(descriptor);
        }
        registry
    }

    /// Insert a backend, or update endpoint-level fields of an existing one.
    /// In-flight counts and latency statistics survive re-registration.
    pub fn upsert(&self, descriptor: BackendDescriptor) {
        if let Some(existing) = self.backends.get(&descriptor.id) {
            let mut inner = existing.inner.lock().expect("backend lock");
            inner.endpoint = descriptor.endpoint;
            inner.max_in_flight = descriptor.max_in_flight;
            // A re-registered tombstone comes back as a fresh, unprobed entry.
            if matches!(inner.stats.state, BackendState::Removed | BackendState::Draining) {
                inner.stats.state = BackendState::Unknown;
                let _ = self.events.send(RegistryEvent::StateChanged {
                    id: descriptor.id.clone(),
                    state: BackendState::Unknown,
                });
            }
            return;
        }

        info!(
            backend = %descriptor.id,
            endpoint = %descriptor.endpoint,
            "Registering backend"
        );
        let entry = Arc::new(BackendEntry {
            id: descriptor.id.clone(),
            model_name: descriptor.model_name.clone(),
            in_flight: AtomicUsize::new(0),
            inner: Mutex::new(EntryInner {
                endpoint: descriptor.endpoint.clone(),
                max_in_flight: descriptor.max_in_flight,
                stats: BackendStats::default(),
            }),
        });
        self.backends.insert(descriptor.id.clone(), entry);
        let _ = self.events.send(RegistryEvent::Added {
            id: descriptor.id,
            model_name: descriptor.model_name,
            endpoint: descriptor.endpoint,
        });
    }

    /// Tombstone a backend. The entry is freed once its in-flight requests
    /// drain. Returns false if the id is unknown.
    pub fn remove(&self, id: &str) -> bool {
        let Some(entry) = self.backends.get(id).map(|e| Arc::clone(&e)) else {
            return false;
        };
        {
            let mut inner = entry.inner.lock().expect("backend lock");
            inner.stats.state = BackendState::Removed;
        }
        let _ = self.events.send(RegistryEvent::Removed { id: id.to_string() });
        if entry.in_flight.load(Ordering::SeqCst) == 0 {
            self.backends.remove(id);
        } else {
            info!(backend = %id, "Backend removed; waiting for in-flight to drain");
        }
        true
    }

    /// Graceful decommission: the backend finishes in-flight work but
    /// receives no new requests. Returns false if the id is unknown.
    pub fn drain(&self, id: &str) -> bool {
        let Some(entry) = self.backends.get(id) else {
            return false;
        };
        let mut inner = entry.inner.lock().expect("backend lock");
        if matches!(inner.stats.state, BackendState::Removed) {
            return false;
        }
        inner.stats.state = BackendState::Draining;
        drop(inner);
        let _ = self.events.send(RegistryEvent::StateChanged {
            id: id.to_string(),
            state: BackendState::Draining,
        });
        true
    }

    /// Snapshot of the currently selectable backends for a model, sorted by
    /// id. Backends at their `max_in_flight` cap are filtered out.
    pub fn list_for_model(&self, model: &str) -> Vec<BackendSnapshot> {
        let mut out: Vec<BackendSnapshot> = self
            .backends
            .iter()
            .filter(|e| e.model_name == model)
            .map(|e| e.snapshot())
            .filter(|s| s.state.selectable())
            .filter(|s| s.max_in_flight.is_none_or(|cap| s.in_flight < cap))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Whether any non-removed backend serves this model (regardless of
    /// health). Distinguishes "unknown model" from "no backend available".
    pub fn has_model(&self, model: &str) -> bool {
        self.backends.iter().any(|e| {
            e.model_name == model
                && !matches!(
                    e.inner.lock().expect("backend lock").stats.state,
                    BackendState::Removed
                )
        })
    }

    /// Distinct model names with at least one selectable backend, sorted.
    pub fn served_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .iter()
            .filter(|e| {
                e.inner
                    .lock()
                    .expect("backend lock")
                    .stats
                    .state
                    .selectable()
            })
            .map(|e| e.model_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// `(id, endpoint)` pairs of all non-removed backends, for the prober.
    pub fn probe_targets(&self) -> Vec<(String, String)> {
        self.backends
            .iter()
            .filter_map(|e| {
                let inner = e.inner.lock().expect("backend lock");
                if matches!(inner.stats.state, BackendState::Removed) {
                    None
                } else {
                    Some((e.id.clone(), inner.endpoint.clone()))
                }
            })
            .collect()
    }

    /// Atomically claim an in-flight slot on a backend. Returns `None` when
    /// the backend is gone, removed, or at its concurrency cap.
    pub fn observe_start(&self, id: &str) -> Option<InFlightToken> {
        let entry = self.backends.get(id).map(|e| Arc::clone(&e))?;
        {
            let inner = entry.inner.lock().expect("backend lock");
            if matches!(inner.stats.state, BackendState::Removed) {
                return None;
            }
            if let Some(cap) = inner.max_in_flight
                && entry.in_flight.load(Ordering::SeqCst) >= cap
            {
                return None;
            }
        }
        let new_count = entry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("agent_proxy_in_flight", "backend" => id.to_string()).set(new_count as f64);
        Some(InFlightToken {
            entry,
            consumed: false,
        })
    }

    /// Complete a request: release the in-flight slot, fold the latency
    /// sample into the window and EMA, and on failure bump the
    /// consecutive-failure counter (sharing the probe threshold).
    pub fn observe_end(&self, mut token: InFlightToken, duration_ms: f64, ok: bool) {
        token.consumed = true;
        let entry = Arc::clone(&token.entry);
        drop(token);
        release_in_flight(&entry);

        let transition = {
            let mut inner = entry.inner.lock().expect("backend lock");
            inner.stats.record_latency(duration_ms);
            if ok {
                inner.stats.consecutive_failures = 0;
                None
            } else {
                inner.stats.record_failure()
            }
        };
        if let Some(state) = transition {
            warn!(backend = %entry.id, ?state, "Backend marked unhealthy after request failures");
            let _ = self.events.send(RegistryEvent::StateChanged {
                id: entry.id.clone(),
                state,
            });
        }
        self.free_if_drained(&entry.id);
    }

    /// Release an in-flight slot for a cancelled request without recording a
    /// latency sample or a backend failure.
    pub fn observe_cancel(&self, mut token: InFlightToken) {
        token.consumed = true;
        let entry = Arc::clone(&token.entry);
        drop(token);
        release_in_flight(&entry);
        self.free_if_drained(&entry.id);
    }

    /// Apply a health-probe result.
    pub fn apply_probe(&self, id: &str, outcome: ProbeOutcome) {
        let Some(entry) = self.backends.get(id).map(|e| Arc::clone(&e)) else {
            return;
        };
        let now = SystemTime::now();
        let (transition, load_changed) = {
            let mut inner = entry.inner.lock().expect("backend lock");
            inner.stats.last_probe_at = Some(now);
            if outcome.ok {
                inner.stats.last_ok_at = Some(now);
                let mut load_changed = None;
                if let Some(load) = outcome.load
                    && (inner.stats.load.is_nan() || inner.stats.load != load)
                {
                    inner.stats.load = load;
                    load_changed = Some(load);
                }
                (inner.stats.record_success(), load_changed)
            } else {
                (inner.stats.record_failure(), None)
            }
        };

        if let Some(state) = transition {
            match state {
                BackendState::Healthy => info!(backend = %id, "Backend healthy"),
                _ => warn!(backend = %id, ?state, "Backend state changed"),
            }
            let _ = self.events.send(RegistryEvent::StateChanged {
                id: id.to_string(),
                state,
            });
        }
        if let Some(load) = load_changed {
            debug!(backend = %id, load, "Backend load updated");
            let _ = self.events.send(RegistryEvent::LoadChanged {
                id: id.to_string(),
                load,
            });
        }
    }

    /// Subscribe to change events. The channel is bounded; lagging
    /// subscribers lose events and should re-sync from `snapshot()`.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Point-in-time view of every backend, sorted by id.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut out: Vec<BackendSnapshot> =
            self.backends.iter().map(|e| e.snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Total in-flight requests across all backends.
    pub fn total_in_flight(&self) -> usize {
        self.backends
            .iter()
            .map(|e| e.in_flight.load(Ordering::SeqCst))
            .sum()
    }

    /// Drop tombstoned entries whose in-flight count has drained.
    pub fn reap(&self) {
        self.backends.retain(|_, entry| {
            let removed = matches!(
                entry.inner.lock().expect("backend lock").stats.state,
                BackendState::Removed
            );
            !(removed && entry.in_flight.load(Ordering::SeqCst) == 0)
        });
    }

    fn free_if_drained(&self, id: &str) {
        let drained = self.backends.get(id).is_some_and(|entry| {
            matches!(
                entry.inner.lock().expect("backend lock").stats.state,
                BackendState::Removed
            ) && entry.in_flight.load(Ordering::SeqCst) == 0
        });
        if drained {
            self.backends.remove(id);
            debug!(backend = %id, "Removed backend freed after drain");
        }
    }
}
