use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use ufse_protocol::Event;

use crate::config::SessionLimits;

/// Result of offering one event to a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    /// Accepted with its future timestamp pulled back to the ingest time.
    Clamped,
    Late,
    SessionMismatch,
    /// The event asked for a reset; the session completed and the event was not stored.
    Reset,
    TooOld,
    /// The session hit its event or age ceiling and completed.
    MemoryPressure,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Accepted | Admission::Clamped)
    }

    /// Nothing after this event in the batch can be admitted.
    pub fn ends_batch(self) -> bool {
        matches!(
            self,
            Admission::Late | Admission::Reset | Admission::MemoryPressure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Admission::Accepted => "accepted",
            Admission::Clamped => "clamped",
            Admission::Late => "late",
            Admission::SessionMismatch => "session_mismatch",
            Admission::Reset => "reset",
            Admission::TooOld => "too_old",
            Admission::MemoryPressure => "memory_pressure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimestampCheck {
    /// In range, or unparseable (tolerated, ordering falls back to ingestion order).
    Keep,
    ClampTo(String),
    TooOld,
}

pub(crate) fn check_timestamp(
    event: &Event,
    now: DateTime<Utc>,
    limits: &SessionLimits,
) -> TimestampCheck {
    let Some(timestamp) = event.parsed_timestamp() else {
        return TimestampCheck::Keep;
    };
    if timestamp > now + limits.clock_skew_tolerance() {
        return TimestampCheck::ClampTo(now.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    if timestamp < now - limits.max_past_timestamp() {
        return TimestampCheck::TooOld;
    }
    TimestampCheck::Keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        ufse_protocol::parse_timestamp("2026-01-30T12:00:00Z").expect("now")
    }

    fn event_at(timestamp: DateTime<Utc>) -> Event {
        Event::new("click", timestamp.to_rfc3339(), "s", "/")
    }

    #[test]
    fn keeps_timestamps_within_tolerance() {
        let limits = SessionLimits::default();
        let event = event_at(now() + Duration::minutes(4));
        assert_eq!(check_timestamp(&event, now(), &limits), TimestampCheck::Keep);
    }

    #[test]
    fn clamps_far_future_timestamps_to_now() {
        let limits = SessionLimits::default();
        let event = event_at(now() + Duration::minutes(6));
        assert_eq!(
            check_timestamp(&event, now(), &limits),
            TimestampCheck::ClampTo("2026-01-30T12:00:00.000Z".to_string())
        );
    }

    #[test]
    fn drops_timestamps_older_than_thirty_days() {
        let limits = SessionLimits::default();
        let event = event_at(now() - Duration::days(31));
        assert_eq!(check_timestamp(&event, now(), &limits), TimestampCheck::TooOld);
    }

    #[test]
    fn tolerates_unparseable_timestamps() {
        let limits = SessionLimits::default();
        let event = Event::new("click", "yesterday-ish", "s", "/");
        assert_eq!(check_timestamp(&event, now(), &limits), TimestampCheck::Keep);
    }

    #[test]
    fn only_terminal_outcomes_end_the_batch() {
        assert!(Admission::Reset.ends_batch());
        assert!(Admission::MemoryPressure.ends_batch());
        assert!(!Admission::TooOld.ends_batch());
        assert!(Admission::Clamped.is_accepted());
    }
}
