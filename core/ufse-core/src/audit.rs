//! Suppression audit log: a bounded record of every candidate, signal or group
//! the pipeline suppressed, with aggregate counts that survive eviction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionRecord {
    pub session_id: String,
    pub route: String,
    pub signal_type: Option<String>,
    pub strength: Option<f64>,
    pub reason: String,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionSummary {
    pub total: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub by_signal_type: BTreeMap<String, u64>,
    pub by_route: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct AuditState {
    records: VecDeque<SuppressionRecord>,
    summary: SuppressionSummary,
}

#[derive(Debug)]
pub struct SuppressionAuditLog {
    capacity: usize,
    state: Mutex<AuditState>,
}

impl SuppressionAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(AuditState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AuditState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Audit log lock poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    pub fn record(&self, record: SuppressionRecord) {
        let mut state = self.state();
        let summary = &mut state.summary;
        summary.total += 1;
        *summary.by_reason.entry(record.reason.clone()).or_default() += 1;
        if let Some(signal_type) = &record.signal_type {
            *summary.by_signal_type.entry(signal_type.clone()).or_default() += 1;
        }
        *summary.by_route.entry(record.route.clone()).or_default() += 1;

        while state.records.len() >= self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(record);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<SuppressionRecord> {
        self.state().records.iter().rev().take(limit).cloned().collect()
    }

    pub fn summary(&self) -> SuppressionSummary {
        self.state().summary.clone()
    }
}

impl Default for SuppressionAuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
