//! Incident delivery to downstream sinks.
//!
//! Delivery is the only retryable step after detection. Each attempt runs
//! under the forwarder's retry policy: capped exponential backoff, a bounded
//! number of attempts, an overall deadline and a cancellation token. Sinks
//! deduplicate on the incident's idempotency key and detection time, so a late
//! retry that succeeds never yields a second copy downstream, while a later,
//! separate struggle at the same failure point is still stored.

use chrono::{DateTime, Utc};
use fs_err as fs;
use std::cmp;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, warn};
use ufse_protocol::Incident;

use crate::config::ForwardingConfig;
use crate::error::{Result, UfseError};
use crate::observability::{Observer, INCIDENTS_FORWARD_FAILED};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Sink lock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    // ─────────────────────────────────────────────────────────────────────
    // Retryable
    // ─────────────────────────────────────────────────────────────────────
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink timed out: {0}")]
    Timeout(String),

    #[error("Sink write failed: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────────────
    // Permanent
    // ─────────────────────────────────────────────────────────────────────
    #[error("Sink rejected incident: {0}")]
    Rejected(String),

    #[error("Incident serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkError::Unavailable(_) | SinkError::Timeout(_) | SinkError::Io(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stored,
    /// The key was already delivered; nothing was written.
    Duplicate,
}

/// Downstream collaborator accepting incidents by idempotency key.
pub trait IncidentSink: Send + Sync {
    fn deliver(&self, key: &str, incident: &Incident) -> std::result::Result<Delivery, SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: StdDuration,
    pub max_backoff: StdDuration,
    pub multiplier: u32,
    pub deadline: StdDuration,
}

impl RetryPolicy {
    pub fn from_config(config: &ForwardingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: StdDuration::from_millis(config.initial_backoff_ms),
            max_backoff: StdDuration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1),
            deadline: StdDuration::from_millis(config.deadline_ms),
        }
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> StdDuration {
        let factor = self
            .multiplier
            .saturating_pow(retry.saturating_sub(1));
        let backoff = self.initial_backoff.saturating_mul(factor);
        cmp::min(backoff, self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ForwardingConfig::default())
    }
}

/// Shared flag that stops further delivery attempts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered { attempts: u32 },
    Duplicate { attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl ForwardOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, ForwardOutcome::Failed { .. })
    }
}

pub struct Forwarder {
    sink: Arc<dyn IncidentSink>,
    policy: RetryPolicy,
    observer: Arc<dyn Observer>,
}

impl Forwarder {
    pub fn new(
        sink: Arc<dyn IncidentSink>,
        policy: RetryPolicy,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            sink,
            policy,
            observer,
        }
    }

    pub fn forward(&self, incident: &Incident, cancel: &CancellationToken) -> ForwardOutcome {
        let key = incident.idempotency_key();
        let started = Instant::now();
        let mut attempts = 0;
        let mut last_error = String::from("not attempted");

        while attempts < self.policy.max_attempts {
            if cancel.is_cancelled() {
                last_error = "cancelled".to_string();
                break;
            }
            if attempts > 0 {
                let backoff = self.policy.backoff_for(attempts);
                if started.elapsed() + backoff > self.policy.deadline {
                    last_error =
                        format!("deadline exceeded after {} attempts: {}", attempts, last_error);
                    break;
                }
                thread::sleep(backoff);
            }
            attempts += 1;

            match self.sink.deliver(&key, incident) {
                Ok(Delivery::Stored) => {
                    debug!(key = %key, attempts, "Incident delivered");
                    return ForwardOutcome::Delivered { attempts };
                }
                Ok(Delivery::Duplicate) => {
                    debug!(key = %key, "Incident already delivered");
                    return ForwardOutcome::Duplicate { attempts };
                }
                Err(err) if err.is_retryable() => {
                    debug!(
                        key = %key,
                        attempt = attempts,
                        error = %err,
                        "Incident delivery failed; retrying"
                    );
                    last_error = err.to_string();
                }
                Err(err) => {
                    last_error = err.to_string();
                    break;
                }
            }
        }

        warn!(
            key = %key,
            incident_id = %incident.incident_id,
            attempts,
            error = %last_error,
            "Incident forwarding gave up"
        );
        self.observer.increment(INCIDENTS_FORWARD_FAILED, None, 1);
        ForwardOutcome::Failed {
            attempts,
            error: last_error,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Detection times already delivered, per idempotency key.
#[derive(Debug, Default)]
struct DeliveredKeys {
    seen: HashMap<String, Vec<DateTime<Utc>>>,
    count: usize,
}

impl DeliveredKeys {
    fn contains(&self, key: &str, detected_at: DateTime<Utc>) -> bool {
        self.seen.get(key).is_some_and(|times| {
            times
                .iter()
                .any(|seen| Incident::is_duplicate_window(*seen, detected_at))
        })
    }

    /// Records the delivery; false when it duplicates an earlier one.
    fn insert(&mut self, key: &str, detected_at: DateTime<Utc>) -> bool {
        if self.contains(key, detected_at) {
            return false;
        }
        self.seen.entry(key.to_string()).or_default().push(detected_at);
        self.count += 1;
        true
    }

    fn len(&self) -> usize {
        self.count
    }
}

struct JsonlState {
    keys: DeliveredKeys,
    file: fs::File,
}

/// Append-only JSON Lines incident log. Keys already present in the file are
/// reloaded on open, so duplicates stay no-ops across restarts.
pub struct JsonlIncidentSink {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlIncidentSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let io_error = |source| UfseError::IncidentLog {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let keys = load_keys(&path).map_err(io_error)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        Ok(Self {
            path,
            state: Mutex::new(JsonlState { keys, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        lock(&self.state).keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_keys(path: &Path) -> std::io::Result<DeliveredKeys> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DeliveredKeys::default())
        }
        Err(err) => return Err(err),
    };
    let mut keys = DeliveredKeys::default();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Incident>(&line) {
            Ok(incident) => {
                keys.insert(&incident.idempotency_key(), incident.detected_at());
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    line = number + 1,
                    error = %err,
                    "Skipping malformed incident line"
                );
            }
        }
    }
    Ok(keys)
}

impl IncidentSink for JsonlIncidentSink {
    fn deliver(&self, key: &str, incident: &Incident) -> std::result::Result<Delivery, SinkError> {
        let mut state = lock(&self.state);
        let detected_at = incident.detected_at();
        if state.keys.contains(key, detected_at) {
            return Ok(Delivery::Duplicate);
        }
        let mut line = serde_json::to_string(incident)?;
        line.push('\n');
        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;
        state.keys.insert(key, detected_at);
        Ok(Delivery::Stored)
    }
}

/// In-memory sink for replay and tests. Can be told to fail its next calls.
#[derive(Default)]
pub struct MemorySink {
    incidents: Mutex<Vec<Incident>>,
    keys: Mutex<DeliveredKeys>,
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `failures` deliveries with a retryable error.
    pub fn failing(failures: usize) -> Self {
        let sink = Self::default();
        sink.failures_remaining.store(failures, Ordering::SeqCst);
        sink
    }

    pub fn incidents(&self) -> Vec<Incident> {
        lock(&self.incidents).clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IncidentSink for MemorySink {
    fn deliver(&self, key: &str, incident: &Incident) -> std::result::Result<Delivery, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        if !lock(&self.keys).insert(key, incident.detected_at()) {
            return Ok(Delivery::Duplicate);
        }
        lock(&self.incidents).push(incident.clone());
        Ok(Delivery::Stored)
    }
}
