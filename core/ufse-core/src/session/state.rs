//! Mutable record of one in-flight session and its lifecycle rules.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;
use ufse_protocol::{Event, RouteTransition, Session, SessionStatus};

use super::admission::{check_timestamp, Admission, TimestampCheck};
use super::ordering::{dedupe_events, sort_events};
use crate::config::SessionLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    IdleTimeout,
    MaxDuration,
    HardCap,
    MaxEvents,
    Reset,
    Collision,
    Flush,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionReason::IdleTimeout => "idle_timeout",
            CompletionReason::MaxDuration => "max_duration",
            CompletionReason::HardCap => "hard_cap",
            CompletionReason::MaxEvents => "max_events",
            CompletionReason::Reset => "reset",
            CompletionReason::Collision => "collision",
            CompletionReason::Flush => "flush",
        }
    }

    /// Anything but the natural idle timeout.
    pub fn is_forced(self) -> bool {
        self != CompletionReason::IdleTimeout
    }
}

#[derive(Debug, Clone)]
pub struct LiveSession {
    session_id: String,
    project_id: String,
    status: SessionStatus,
    events: Vec<Event>,
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    current_route: String,
    route_transitions: Vec<RouteTransition>,
    completion_reason: Option<CompletionReason>,
    handed_off: bool,
}

impl LiveSession {
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            status: SessionStatus::Active,
            events: Vec::new(),
            start_time: now,
            last_activity: now,
            current_route: String::new(),
            route_transitions: Vec::new(),
            completion_reason: None,
            handed_off: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn route_transitions(&self) -> &[RouteTransition] {
        &self.route_transitions
    }

    pub fn completion_reason(&self) -> Option<CompletionReason> {
        self.completion_reason
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Applies the admission policy to one event. Order matters: a completed
    /// session rejects everything before any other rule runs.
    pub fn admit(
        &mut self,
        mut event: Event,
        now: DateTime<Utc>,
        limits: &SessionLimits,
    ) -> Admission {
        if self.is_completed() {
            return Admission::Late;
        }
        if event.session_id != self.session_id {
            return Admission::SessionMismatch;
        }
        if event.is_reset() {
            self.complete(CompletionReason::Reset);
            return Admission::Reset;
        }

        let outcome = match check_timestamp(&event, now, limits) {
            TimestampCheck::Keep => Admission::Accepted,
            TimestampCheck::ClampTo(clamped) => {
                event.timestamp = clamped;
                Admission::Clamped
            }
            TimestampCheck::TooOld => return Admission::TooOld,
        };

        if self.events.len() >= limits.max_events {
            self.complete(CompletionReason::MaxEvents);
            return Admission::MemoryPressure;
        }
        if now - self.start_time > limits.max_duration_hard() {
            self.complete(CompletionReason::HardCap);
            return Admission::MemoryPressure;
        }

        self.record_route(&event, now);
        self.events.push(event);
        self.last_activity = now;
        if self.status == SessionStatus::Idle {
            self.transition(SessionStatus::Active);
        }
        outcome
    }

    /// True when the event was stored.
    pub fn add_event(&mut self, event: Event, now: DateTime<Utc>, limits: &SessionLimits) -> bool {
        self.admit(event, now, limits).is_accepted()
    }

    /// Restores timestamp order and removes duplicates after a batch.
    pub fn finish_batch(&mut self) {
        sort_events(&mut self.events);
        let events = std::mem::take(&mut self.events);
        self.events = dedupe_events(events);
    }

    fn record_route(&mut self, event: &Event, now: DateTime<Utc>) {
        if event.route.is_empty() || event.route == self.current_route {
            return;
        }
        if !self.current_route.is_empty() {
            self.route_transitions.push(RouteTransition {
                from: self.current_route.clone(),
                to: event.route.clone(),
                timestamp: event.parsed_timestamp().unwrap_or(now),
            });
        }
        self.current_route = event.route.clone();
    }

    fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        debug!(
            session_id = %self.session_id,
            from = self.status.as_str(),
            to = next.as_str(),
            "Session state transition"
        );
        self.status = next;
        true
    }

    /// Moves the session to Completed. No-op when already completed.
    pub fn complete(&mut self, reason: CompletionReason) -> bool {
        if !self.transition(SessionStatus::Completed) {
            return false;
        }
        self.completion_reason = Some(reason);
        true
    }

    pub fn should_complete(
        &self,
        now: DateTime<Utc>,
        limits: &SessionLimits,
    ) -> Option<CompletionReason> {
        if self.is_completed() {
            return None;
        }
        let age = now - self.start_time;
        if age > limits.max_duration_hard() {
            return Some(CompletionReason::HardCap);
        }
        if age > limits.max_duration() {
            return Some(CompletionReason::MaxDuration);
        }
        let idle_for = now - self.last_activity;
        let idle_limit = match self.status {
            SessionStatus::Idle => limits.completion_timeout(),
            _ => limits.idle_timeout() + limits.completion_timeout(),
        };
        if idle_for > idle_limit {
            return Some(CompletionReason::IdleTimeout);
        }
        None
    }

    /// Re-evaluates time-driven transitions. Returns the completion reason when
    /// this call completed the session.
    pub fn update_state(
        &mut self,
        now: DateTime<Utc>,
        limits: &SessionLimits,
    ) -> Option<CompletionReason> {
        if let Some(reason) = self.should_complete(now, limits) {
            self.complete(reason);
            return Some(reason);
        }
        if self.status == SessionStatus::Active
            && now - self.last_activity > limits.idle_timeout()
        {
            self.transition(SessionStatus::Idle);
        }
        None
    }

    pub fn can_emit(&self) -> bool {
        self.is_completed() && !self.handed_off && !self.events.is_empty()
    }

    /// Marks the snapshot as delivered so no later sweep emits it again.
    pub fn mark_handed_off(&mut self) {
        self.handed_off = true;
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.is_completed() && now - self.start_time > retention
    }

    /// Immutable snapshot for the pipeline. `None` unless completed and non-empty.
    pub fn to_session(&self) -> Option<Session> {
        if !self.can_emit() {
            return None;
        }
        let last_event = self.events.iter().rev().find_map(Event::parsed_timestamp);
        let end_time = match last_event {
            Some(timestamp) if timestamp > self.last_activity => timestamp,
            _ => self.last_activity,
        };
        let mut metadata = Map::new();
        metadata.insert("eventCount".to_string(), Value::from(self.events.len()));
        Some(Session {
            session_id: self.session_id.clone(),
            project_id: self.project_id.clone(),
            status: self.status,
            events: self.events.clone(),
            start_time: self.start_time,
            last_activity: self.last_activity,
            end_time: Some(end_time),
            route_transitions: self.route_transitions.clone(),
            completion_reason: self
                .completion_reason
                .map(|reason| reason.as_str().to_string()),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufse_protocol::{parse_timestamp, Target};

    fn t0() -> DateTime<Utc> {
        parse_timestamp("2026-01-30T12:00:00Z").expect("t0")
    }

    fn click(offset_secs: i64, route: &str) -> Event {
        Event::new(
            "click",
            (t0() + Duration::seconds(offset_secs)).to_rfc3339(),
            "session-1",
            route,
        )
        .with_target(Target::new("button").with_id("buy"))
    }

    fn session() -> LiveSession {
        LiveSession::new("session-1", "project-1", t0())
    }

    #[test]
    fn accepts_event_and_tracks_activity() {
        let limits = SessionLimits::default();
        let mut live = session();
        let now = t0() + Duration::seconds(5);
        assert!(live.add_event(click(5, "/home"), now, &limits));
        assert_eq!(live.events().len(), 1);
        assert_eq!(live.last_activity(), now);
        assert!(live.route_transitions().is_empty());
    }

    #[test]
    fn records_route_transitions_after_first_route() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(1, "/home"), t0(), &limits);
        live.add_event(click(2, "/home"), t0(), &limits);
        live.add_event(click(3, "/cart"), t0(), &limits);
        let transitions = live.route_transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, "/home");
        assert_eq!(transitions[0].to, "/cart");
    }

    #[test]
    fn completed_session_rejects_and_stays_unchanged() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(1, "/home"), t0(), &limits);
        assert!(live.complete(CompletionReason::Flush));
        let before = live.events().to_vec();

        assert_eq!(live.admit(click(2, "/home"), t0(), &limits), Admission::Late);
        assert!(!live.add_event(click(3, "/home"), t0(), &limits));
        assert_eq!(live.events(), before.as_slice());
        assert!(!live.complete(CompletionReason::IdleTimeout));
        assert_eq!(live.completion_reason(), Some(CompletionReason::Flush));
    }

    #[test]
    fn rejects_foreign_session_id() {
        let limits = SessionLimits::default();
        let mut live = session();
        let mut event = click(1, "/home");
        event.session_id = "other".to_string();
        assert_eq!(live.admit(event, t0(), &limits), Admission::SessionMismatch);
        assert!(live.events().is_empty());
    }

    #[test]
    fn reset_completes_without_storing() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(1, "/home"), t0(), &limits);
        let reset = Event::new("navigation", t0().to_rfc3339(), "session-1", "/")
            .with_metadata("reset", true);
        assert_eq!(live.admit(reset, t0(), &limits), Admission::Reset);
        assert!(live.is_completed());
        assert_eq!(live.events().len(), 1);
        assert_eq!(live.completion_reason(), Some(CompletionReason::Reset));
    }

    #[test]
    fn clamps_future_timestamp() {
        let limits = SessionLimits::default();
        let mut live = session();
        let outcome = live.admit(click(3600, "/home"), t0(), &limits);
        assert_eq!(outcome, Admission::Clamped);
        assert_eq!(live.events()[0].parsed_timestamp(), Some(t0()));
    }

    #[test]
    fn event_ceiling_forces_completion() {
        let limits = SessionLimits {
            max_events: 2,
            ..SessionLimits::default()
        };
        let mut live = session();
        assert!(live.add_event(click(1, "/a"), t0(), &limits));
        assert!(live.add_event(click(2, "/a"), t0(), &limits));
        assert_eq!(
            live.admit(click(3, "/a"), t0(), &limits),
            Admission::MemoryPressure
        );
        assert_eq!(live.events().len(), 2);
        assert_eq!(live.completion_reason(), Some(CompletionReason::MaxEvents));
    }

    #[test]
    fn idle_then_active_then_completed() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(0, "/a"), t0(), &limits);

        let idle_at = t0() + Duration::minutes(6);
        assert_eq!(live.update_state(idle_at, &limits), None);
        assert_eq!(live.status(), SessionStatus::Idle);

        assert!(live.add_event(click(360, "/a"), idle_at, &limits));
        assert_eq!(live.status(), SessionStatus::Active);

        let done_at = idle_at + Duration::minutes(16);
        assert_eq!(
            live.update_state(done_at, &limits),
            Some(CompletionReason::IdleTimeout)
        );
        assert!(live.is_completed());
    }

    #[test]
    fn idle_session_completes_after_completion_timeout() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(0, "/a"), t0(), &limits);
        live.update_state(t0() + Duration::minutes(6), &limits);
        assert_eq!(live.status(), SessionStatus::Idle);
        assert_eq!(
            live.should_complete(t0() + Duration::minutes(11), &limits),
            Some(CompletionReason::IdleTimeout)
        );
    }

    #[test]
    fn long_sessions_hit_max_duration() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(0, "/a"), t0(), &limits);
        // keep it busy so the idle rules never fire
        let late = t0() + Duration::hours(4) + Duration::seconds(1);
        live.last_activity = late;
        assert_eq!(
            live.should_complete(late, &limits),
            Some(CompletionReason::MaxDuration)
        );
    }

    #[test]
    fn finish_batch_sorts_and_dedupes() {
        let limits = SessionLimits::default();
        let mut live = session();
        live.add_event(click(2, "/a"), t0(), &limits);
        live.add_event(click(1, "/a"), t0(), &limits);
        live.add_event(click(2, "/a"), t0(), &limits);
        live.finish_batch();
        let offsets: Vec<String> = live.events().iter().map(|e| e.timestamp.clone()).collect();
        assert_eq!(offsets.len(), 2);
        assert!(offsets[0] < offsets[1]);
    }

    #[test]
    fn snapshot_requires_completed_non_empty_session() {
        let limits = SessionLimits::default();
        let mut live = session();
        assert!(live.to_session().is_none());
        live.complete(CompletionReason::Flush);
        assert!(live.to_session().is_none());

        let mut live = session();
        live.add_event(click(30, "/a"), t0(), &limits);
        live.complete(CompletionReason::Flush);
        let snapshot = live.to_session().expect("snapshot");
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.end_time, Some(t0() + Duration::seconds(30)));
        assert_eq!(snapshot.completion_reason.as_deref(), Some("flush"));
        assert_eq!(snapshot.metadata["eventCount"], 1);
    }
}
