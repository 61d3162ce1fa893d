//! Shadow mode: build incidents, record them, never emit them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;
use ufse_protocol::Incident;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Shadow mode lock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShadowIncident {
    pub incident: Incident,
    pub route: String,
    /// Whether the incident would have been emitted outside shadow mode.
    pub would_emit: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShadowMetrics {
    pub total_detections: u64,
    pub by_confidence: BTreeMap<String, u64>,
    pub by_signal_type: BTreeMap<String, u64>,
    pub by_route: BTreeMap<String, u64>,
    pub would_emit: u64,
    pub would_suppress: u64,
    pub first_detection: Option<DateTime<Utc>>,
    pub last_detection: Option<DateTime<Utc>>,
}

impl ShadowMetrics {
    fn record(&mut self, entry: &ShadowIncident) {
        self.total_detections += 1;
        *self
            .by_confidence
            .entry(entry.incident.confidence_level.as_str().to_string())
            .or_default() += 1;
        for signal_type in &entry.incident.triggering_signals {
            *self.by_signal_type.entry(signal_type.clone()).or_default() += 1;
        }
        *self.by_route.entry(entry.route.clone()).or_default() += 1;
        if entry.would_emit {
            self.would_emit += 1;
        } else {
            self.would_suppress += 1;
        }
        self.first_detection.get_or_insert(entry.recorded_at);
        self.last_detection = Some(entry.recorded_at);
    }
}

/// Bounded, oldest-evicted store of shadow incidents.
#[derive(Debug)]
pub struct ShadowIncidentStore {
    capacity: usize,
    incidents: VecDeque<ShadowIncident>,
}

impl ShadowIncidentStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            incidents: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: ShadowIncident) {
        while self.incidents.len() >= self.capacity {
            self.incidents.pop_front();
        }
        self.incidents.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ShadowIncident> {
        self.incidents.iter().rev().take(limit).cloned().collect()
    }

    /// Newest first.
    pub fn by_route(&self, route: &str, limit: usize) -> Vec<ShadowIncident> {
        self.incidents
            .iter()
            .rev()
            .filter(|entry| entry.route == route)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Caller-owned shadow recorder shared by pipeline runs.
#[derive(Debug)]
pub struct ShadowModeManager {
    metrics: Mutex<ShadowMetrics>,
    store: Mutex<ShadowIncidentStore>,
}

impl ShadowModeManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            metrics: Mutex::new(ShadowMetrics::default()),
            store: Mutex::new(ShadowIncidentStore::new(capacity)),
        }
    }

    pub fn record(&self, incident: Incident, route: &str, would_emit: bool, at: DateTime<Utc>) {
        let entry = ShadowIncident {
            incident,
            route: route.to_string(),
            would_emit,
            recorded_at: at,
        };
        lock(&self.metrics).record(&entry);
        lock(&self.store).push(entry);
    }

    pub fn metrics(&self) -> ShadowMetrics {
        lock(&self.metrics).clone()
    }

    pub fn recent(&self, limit: usize) -> Vec<ShadowIncident> {
        lock(&self.store).recent(limit)
    }

    pub fn by_route(&self, route: &str, limit: usize) -> Vec<ShadowIncident> {
        lock(&self.store).by_route(route, limit)
    }

    pub fn stored(&self) -> usize {
        lock(&self.store).len()
    }
}

impl Default for ShadowModeManager {
    fn default() -> Self {
        Self::new(1000)
    }
}
