//! Concurrent session store and its background sweeps.
//!
//! Locking is two-level: the store map lock only guards id → record lookups,
//! inserts and removals; each record carries its own mutex for field updates.
//! Sweeps snapshot the ids under a short read lock and then visit records one
//! at a time, so no sweep ever holds the map lock while working on a session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};
use ufse_protocol::{Event, Session, SessionStatus};

use super::admission::Admission;
use super::state::{CompletionReason, LiveSession};
use crate::config::SessionLimits;
use crate::observability::{
    Observer, EVENTS_DROPPED, HANDOFF_QUEUE_FULL, SESSIONS_FORCE_COMPLETED,
};

type SharedSession = Arc<Mutex<LiveSession>>;

const STOP_POLL_INTERVAL: StdDuration = StdDuration::from_millis(200);

fn lock_session(session: &SharedSession) -> MutexGuard<'_, LiveSession> {
    match session.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Session lock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub dropped: usize,
    pub completed: bool,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub active: usize,
    pub idle: usize,
    pub completed: usize,
    pub superseded: usize,
}

impl StoreSnapshot {
    /// Sessions still held by the store, in any state.
    pub fn total(&self) -> usize {
        self.active + self.idle + self.completed + self.superseded
    }
}

/// Owns every live session and hands completed ones to the pipeline.
pub struct SessionManager {
    limits: SessionLimits,
    sessions: RwLock<HashMap<String, SharedSession>>,
    // Force-completed by a collision and replaced in the map, awaiting hand-off.
    superseded: Mutex<Vec<SharedSession>>,
    handoff: SyncSender<Session>,
    observer: Arc<dyn Observer>,
    stop: AtomicBool,
}

impl SessionManager {
    /// Creates the manager together with the receiving end of its bounded
    /// hand-off queue.
    pub fn new(limits: SessionLimits, observer: Arc<dyn Observer>) -> (Self, Receiver<Session>) {
        let (sender, receiver) = mpsc::sync_channel(limits.handoff_capacity.max(1));
        let manager = Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
            superseded: Mutex::new(Vec::new()),
            handoff: sender,
            observer,
            stop: AtomicBool::new(false),
        };
        (manager, receiver)
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    fn session_ids(&self) -> Vec<String> {
        match self.sessions.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    fn get(&self, session_id: &str) -> Option<SharedSession> {
        match self.sessions.read() {
            Ok(map) => map.get(session_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(session_id).cloned(),
        }
    }

    fn with_map<T>(&self, update: impl FnOnce(&mut HashMap<String, SharedSession>) -> T) -> T {
        match self.sessions.write() {
            Ok(mut map) => update(&mut map),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    fn with_superseded<T>(&self, update: impl FnOnce(&mut Vec<SharedSession>) -> T) -> T {
        match self.superseded.lock() {
            Ok(mut list) => update(&mut list),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    /// Finds the session for `session_id`, creating it on first sight. A
    /// different project id on a non-empty session is a collision: the old
    /// record is force-completed and parked for hand-off, and a fresh one
    /// takes its slot.
    fn get_or_create(
        &self,
        project_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> SharedSession {
        if let Some(existing) = self.get(session_id) {
            let collides = {
                let live = lock_session(&existing);
                live.project_id() != project_id && !live.is_completed()
            };
            if !collides {
                return existing;
            }
        }

        self.with_map(|map| {
            let fresh = || Arc::new(Mutex::new(LiveSession::new(session_id, project_id, now)));
            match map.get(session_id).cloned() {
                None => {
                    debug!(session_id = %session_id, project_id = %project_id, "Session created");
                    let created = fresh();
                    map.insert(session_id.to_string(), Arc::clone(&created));
                    created
                }
                Some(existing) => {
                    let mut live = lock_session(&existing);
                    if live.project_id() == project_id || live.is_completed() {
                        drop(live);
                        return existing;
                    }
                    let had_events = !live.events().is_empty();
                    live.complete(CompletionReason::Collision);
                    warn!(
                        session_id = %session_id,
                        previous_project = %live.project_id(),
                        project_id = %project_id,
                        "Session id collision; superseding previous session"
                    );
                    drop(live);
                    self.observer.increment(
                        SESSIONS_FORCE_COMPLETED,
                        Some(CompletionReason::Collision.as_str()),
                        1,
                    );
                    if had_events {
                        self.with_superseded(|list| list.push(existing));
                    }
                    let created = fresh();
                    map.insert(session_id.to_string(), Arc::clone(&created));
                    created
                }
            }
        })
    }

    /// Admits one batch of events for a session.
    pub fn ingest(
        &self,
        project_id: &str,
        session_id: &str,
        events: Vec<Event>,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        let shared = self.get_or_create(project_id, session_id, now);
        let mut live = lock_session(&shared);
        let mut outcome = IngestOutcome::default();
        let total = events.len();

        for event in events {
            let admission = live.admit(event, now, &self.limits);
            if admission.is_accepted() {
                outcome.accepted += 1;
                continue;
            }
            outcome.dropped += 1;
            self.observer
                .increment(EVENTS_DROPPED, Some(admission.as_str()), 1);
            debug!(
                session_id = %session_id,
                reason = admission.as_str(),
                "Event not admitted"
            );
            if admission.ends_batch() {
                if admission != Admission::Late {
                    if let Some(reason) = live.completion_reason() {
                        self.observer
                            .increment(SESSIONS_FORCE_COMPLETED, Some(reason.as_str()), 1);
                        info!(
                            session_id = %session_id,
                            reason = reason.as_str(),
                            "Session force-completed during ingest"
                        );
                    }
                }
                break;
            }
        }

        let remaining = total - outcome.accepted - outcome.dropped;
        if remaining > 0 {
            outcome.dropped += remaining;
            self.observer
                .increment(EVENTS_DROPPED, Some(Admission::Late.as_str()), remaining as u64);
        }

        live.finish_batch();
        outcome.completed = live.is_completed();
        outcome
    }

    /// Time-driven Active → Idle → Completed transitions.
    pub fn update_states(&self, now: DateTime<Utc>) -> usize {
        let mut completed = 0;
        for session_id in self.session_ids() {
            let Some(shared) = self.get(&session_id) else {
                continue;
            };
            let mut live = lock_session(&shared);
            if let Some(reason) = live.update_state(now, &self.limits) {
                completed += 1;
                if reason.is_forced() {
                    self.observer
                        .increment(SESSIONS_FORCE_COMPLETED, Some(reason.as_str()), 1);
                }
                debug!(session_id = %session_id, reason = reason.as_str(), "Session completed");
            }
        }
        completed
    }

    /// Drops completed sessions older than the retention window.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let retention = self.limits.completed_retention();
        let mut removed = 0;
        for session_id in self.session_ids() {
            let Some(shared) = self.get(&session_id) else {
                continue;
            };
            let expired = lock_session(&shared).is_expired(now, retention);
            if expired && self.remove_if_same(&session_id, &shared) {
                removed += 1;
            }
        }
        removed += self.with_superseded(|list| {
            let before = list.len();
            list.retain(|shared| !lock_session(shared).is_expired(now, retention));
            before - list.len()
        });
        if removed > 0 {
            info!(removed, "Expired completed sessions removed");
        }
        removed
    }

    fn remove_if_same(&self, session_id: &str, shared: &SharedSession) -> bool {
        self.with_map(|map| match map.get(session_id) {
            Some(current) if Arc::ptr_eq(current, shared) => {
                map.remove(session_id);
                true
            }
            _ => false,
        })
    }

    /// Offers one record to the queue. `Some(true)` when handed off, `Some(false)`
    /// when the queue is full, `None` when the record is not emittable.
    fn try_hand_off(&self, shared: &SharedSession) -> Option<bool> {
        let mut live = lock_session(shared);
        let snapshot = live.to_session()?;
        let session_id = snapshot.session_id.clone();
        match self.handoff.try_send(snapshot) {
            Ok(()) => {
                live.mark_handed_off();
                debug!(session_id = %session_id, "Session handed off to pipeline");
                Some(true)
            }
            Err(TrySendError::Full(_)) => {
                self.observer.increment(HANDOFF_QUEUE_FULL, None, 1);
                warn!(session_id = %session_id, "Hand-off queue full; retrying next sweep");
                Some(false)
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(session_id = %session_id, "Pipeline receiver gone; keeping session");
                Some(false)
            }
        }
    }

    /// Hands completed, non-empty sessions to the pipeline and removes them.
    /// Sessions that do not fit in the queue stay put for the next tick.
    pub fn emit_completed(&self) -> usize {
        let mut handed_off = 0;

        let parked = self.with_superseded(std::mem::take);
        let mut kept = Vec::new();
        for shared in parked {
            match self.try_hand_off(&shared) {
                Some(true) => handed_off += 1,
                Some(false) => kept.push(shared),
                None => {}
            }
        }
        if !kept.is_empty() {
            self.with_superseded(|list| list.extend(kept));
        }

        for session_id in self.session_ids() {
            let Some(shared) = self.get(&session_id) else {
                continue;
            };
            if let Some(true) = self.try_hand_off(&shared) {
                self.remove_if_same(&session_id, &shared);
                handed_off += 1;
            }
        }
        handed_off
    }

    /// Completes every open session and emits everything that fits.
    pub fn flush(&self) -> usize {
        for session_id in self.session_ids() {
            if let Some(shared) = self.get(&session_id) {
                lock_session(&shared).complete(CompletionReason::Flush);
            }
        }
        self.emit_completed()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot {
            superseded: self.with_superseded(|list| list.len()),
            ..StoreSnapshot::default()
        };
        for session_id in self.session_ids() {
            let Some(shared) = self.get(&session_id) else {
                continue;
            };
            match lock_session(&shared).status() {
                SessionStatus::Active => snapshot.active += 1,
                SessionStatus::Idle => snapshot.idle += 1,
                SessionStatus::Completed => snapshot.completed += 1,
            };
        }
        snapshot
    }

    /// Starts the state, cleanup and emission sweeps.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweeps: [(&str, StdDuration, fn(&SessionManager)); 3] = [
            ("state", self.limits.state_sweep_interval(), |manager| {
                manager.update_states(Utc::now());
            }),
            ("cleanup", self.limits.cleanup_sweep_interval(), |manager| {
                manager.cleanup(Utc::now());
            }),
            ("emission", self.limits.emission_sweep_interval(), |manager| {
                manager.emit_completed();
            }),
        ];

        sweeps
            .into_iter()
            .map(|(name, interval, sweep)| {
                let manager = Arc::clone(self);
                info!(sweep = name, interval_secs = interval.as_secs(), "Session sweep started");
                thread::spawn(move || {
                    while manager.sleep_unless_stopped(interval) {
                        sweep(&manager);
                    }
                    debug!(sweep = name, "Session sweep stopped");
                })
            })
            .collect()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // Sleeps in short slices so stop() takes effect promptly.
    fn sleep_unless_stopped(&self, interval: StdDuration) -> bool {
        let mut slept = StdDuration::ZERO;
        while slept < interval {
            if self.is_stopped() {
                return false;
            }
            let slice = STOP_POLL_INTERVAL.min(interval - slept);
            thread::sleep(slice);
            slept += slice;
        }
        !self.is_stopped()
    }
}
