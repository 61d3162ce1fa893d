use chrono::{DateTime, Utc};
use serde::Serialize;
use ufse_protocol::{Event, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Interaction,
    SystemFeedback,
    Navigation,
    Performance,
}

/// Category of an event from its type, falling back to metadata for
/// unrecognised types.
pub fn classify(event: &Event) -> EventCategory {
    match event.event_type.as_str() {
        "click" | "input" | "scroll" | "form_submit" => EventCategory::Interaction,
        "error" | "network_error" | "network_success" | "slow_response" => {
            EventCategory::SystemFeedback
        }
        "navigation" | "route_change" => EventCategory::Navigation,
        "long_task" | "performance" | "loading" => EventCategory::Performance,
        _ if is_rejection_metadata(event) => EventCategory::SystemFeedback,
        _ => EventCategory::Interaction,
    }
}

fn is_rejection_metadata(event: &Event) -> bool {
    matches!(event.http_status(), Some(status) if status >= 400) || event.has_metadata("error")
}

/// An event paired with its category and a usable instant.
#[derive(Debug, Clone, Copy)]
pub struct ClassifiedEvent<'a> {
    pub event: &'a Event,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    /// Position within the session, used as a tiebreaker.
    pub index: usize,
}

impl<'a> ClassifiedEvent<'a> {
    pub fn route(&self) -> &'a str {
        &self.event.route
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event.is_type(event_type)
    }

    pub fn is_click(&self) -> bool {
        self.event.is_type("click")
    }

    pub fn is_navigation(&self) -> bool {
        self.category == EventCategory::Navigation
    }

    pub fn is_system_feedback(&self) -> bool {
        self.category == EventCategory::SystemFeedback
    }

    /// System rejection: an error event, or an error status or payload.
    pub fn is_rejection(&self) -> bool {
        self.is_type("error") || self.is_type("network_error") || is_rejection_metadata(self.event)
    }

    pub fn is_success_response(&self) -> bool {
        self.event.is_success_response()
    }
}

/// Classifies every event in session order. Events whose timestamp does not
/// parse borrow the previous event's instant (the session start for the first
/// one), keeping them in place without failing the run.
pub fn classify_session(session: &Session) -> Vec<ClassifiedEvent<'_>> {
    let mut last = session.start_time;
    session
        .events
        .iter()
        .enumerate()
        .map(|(index, event)| {
            let timestamp = event.parsed_timestamp().unwrap_or(last);
            last = timestamp;
            ClassifiedEvent {
                event,
                category: classify(event),
                timestamp,
                index,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, "2026-01-30T12:00:00Z", "s", "/home")
    }

    #[test]
    fn classifies_known_types() {
        assert_eq!(classify(&event("click")), EventCategory::Interaction);
        assert_eq!(classify(&event("form_submit")), EventCategory::Interaction);
        assert_eq!(classify(&event("network_success")), EventCategory::SystemFeedback);
        assert_eq!(classify(&event("route_change")), EventCategory::Navigation);
        assert_eq!(classify(&event("long_task")), EventCategory::Performance);
    }

    #[test]
    fn unknown_type_with_error_status_is_feedback() {
        let response = event("api_response").with_metadata("status", 502);
        assert_eq!(classify(&response), EventCategory::SystemFeedback);
        let payload = event("custom").with_metadata("error", "boom");
        assert_eq!(classify(&payload), EventCategory::SystemFeedback);
    }

    #[test]
    fn unknown_type_defaults_to_interaction() {
        let response = event("api_response").with_metadata("status", 200);
        assert_eq!(classify(&response), EventCategory::Interaction);
    }

    #[test]
    fn classification_is_deterministic() {
        let sample = event("hover").with_metadata("status", 404);
        assert_eq!(classify(&sample), classify(&sample.clone()));
    }

    #[test]
    fn unparseable_timestamp_borrows_previous_instant() {
        let mut broken = event("click");
        broken.timestamp = "nope".to_string();
        let session = Session::from_events(
            "s",
            "p",
            vec![event("navigation"), broken],
        );
        let classified = classify_session(&session);
        assert_eq!(classified[1].timestamp, classified[0].timestamp);
        assert_eq!(classified[1].index, 1);
    }
}
