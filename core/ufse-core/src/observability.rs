//! Metrics port.
//!
//! The engine reports counters and histogram samples through [`Observer`] and
//! never owns metric storage. [`InMemoryObserver`] is the bundled recorder used
//! by the daemon's `get_metrics` method and by tests.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const SESSIONS_PROCESSED: &str = "sessions_processed";
pub const SIGNALS_DETECTED: &str = "signals_detected";
pub const SIGNALS_DISCARDED: &str = "signals_discarded";
pub const INCIDENTS_EMITTED: &str = "incidents_emitted";
pub const SINGLE_SIGNAL_INCIDENTS: &str = "single_signal_incidents";
pub const MEDIUM_CONFIDENCE_INCIDENTS: &str = "medium_confidence_incidents";
pub const RAGE_BAIT_DETECTIONS: &str = "rage_bait_detections";
pub const SHADOW_DETECTIONS: &str = "shadow_detections";
pub const EVENTS_DROPPED: &str = "events_dropped";
pub const SESSIONS_FORCE_COMPLETED: &str = "sessions_force_completed";
pub const HANDOFF_QUEUE_FULL: &str = "handoff_queue_full";
pub const INCIDENTS_FORWARD_FAILED: &str = "incidents_forward_failed";

pub const PROCESSING_DURATION_SECONDS: &str = "processing_duration_seconds";
pub const SIGNAL_STRENGTH: &str = "signal_strength";
pub const DARK_PATTERN_SCORE: &str = "dark_pattern_score";

pub trait Observer: Send + Sync {
    fn increment(&self, counter: &str, label: Option<&str>, by: u64);
    fn observe(&self, histogram: &str, label: Option<&str>, value: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn increment(&self, _counter: &str, _label: Option<&str>, _by: u64) {}
    fn observe(&self, _histogram: &str, _label: Option<&str>, _value: f64) {}
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count = self.count.saturating_add(1);
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str, label: Option<&str>) -> u64 {
        self.counters
            .get(&metric_key(name, label))
            .copied()
            .unwrap_or(0)
    }

    pub fn histogram(&self, name: &str, label: Option<&str>) -> Option<&HistogramSummary> {
        self.histograms.get(&metric_key(name, label))
    }
}

fn metric_key(name: &str, label: Option<&str>) -> String {
    match label {
        Some(label) => format!("{}{{{}}}", name, label),
        None => name.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryObserver {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_metrics(&self, update: impl FnOnce(&mut MetricsSnapshot)) {
        match self.inner.lock() {
            Ok(mut guard) => update(&mut guard),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }
}

impl Observer for InMemoryObserver {
    fn increment(&self, counter: &str, label: Option<&str>, by: u64) {
        let key = metric_key(counter, label);
        self.with_metrics(|metrics| {
            let entry = metrics.counters.entry(key).or_insert(0);
            *entry = entry.saturating_add(by);
        });
    }

    fn observe(&self, histogram: &str, label: Option<&str>, value: f64) {
        if !value.is_finite() {
            return;
        }
        let key = metric_key(histogram, label);
        self.with_metrics(|metrics| {
            metrics
                .histograms
                .entry(key)
                .or_insert(HistogramSummary {
                    count: 0,
                    sum: 0.0,
                    min: 0.0,
                    max: 0.0,
                })
                .record(value);
        });
    }
}
