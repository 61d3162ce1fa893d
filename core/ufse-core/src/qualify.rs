//! Signal qualification: temporal proximity, a plausible cause, and no later
//! success that would show the user got through.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

use crate::classify::ClassifiedEvent;
use crate::config::{bounded_secs, QualificationConfig};
use crate::signals::{is_completion_route, navigation_destination, CandidateSignal, SignalType};

/// A candidate that passed qualification.
#[derive(Debug, Clone, PartialEq)]
pub struct QualifiedSignal {
    pub candidate: CandidateSignal,
    /// System feedback occurred close to the signal.
    pub is_system_feedback: bool,
    pub strength: f64,
}

impl QualifiedSignal {
    pub fn signal_type(&self) -> SignalType {
        self.candidate.signal_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.candidate.timestamp
    }

    pub fn route(&self) -> &str {
        &self.candidate.route
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationFailure {
    Isolated,
    NoCause,
    ResolvedLater,
}

impl QualificationFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            QualificationFailure::Isolated => "isolated",
            QualificationFailure::NoCause => "no_cause",
            QualificationFailure::ResolvedLater => "resolved_later",
        }
    }
}

impl fmt::Display for QualificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn within(event: &ClassifiedEvent<'_>, at: DateTime<Utc>, radius: Duration) -> bool {
    (event.timestamp - at).abs() <= radius
}

/// Rage and blocked need system feedback shortly after they start; the other
/// detectors establish their own cause.
fn needs_feedback_cause(signal_type: SignalType) -> bool {
    matches!(signal_type, SignalType::Rage | SignalType::Blocked)
}

fn is_success_resolution(event: &ClassifiedEvent<'_>) -> bool {
    event.is_success_response()
        || (event.is_navigation() && is_completion_route(navigation_destination(event.event)))
}

pub fn qualify(
    candidate: CandidateSignal,
    events: &[ClassifiedEvent<'_>],
    config: &QualificationConfig,
) -> Result<QualifiedSignal, QualificationFailure> {
    let at = candidate.timestamp;
    let proximity = bounded_secs(config.proximity_window_secs);
    let cause_window = bounded_secs(config.cause_window_secs);
    let feedback_window = bounded_secs(config.feedback_window_secs);

    let nearby = events
        .iter()
        .filter(|event| within(event, at, proximity))
        .count();
    if nearby < 2 {
        return Err(QualificationFailure::Isolated);
    }

    if needs_feedback_cause(candidate.signal_type)
        && !events.iter().any(|event| {
            event.is_system_feedback()
                && event.timestamp > at
                && event.timestamp <= at + cause_window
        })
    {
        return Err(QualificationFailure::NoCause);
    }

    if events
        .iter()
        .filter(|event| event.timestamp > at && event.timestamp <= at + proximity)
        .any(is_success_resolution)
    {
        return Err(QualificationFailure::ResolvedLater);
    }

    let is_system_feedback = events
        .iter()
        .any(|event| event.is_system_feedback() && within(event, at, feedback_window));
    let strength = candidate.strength();
    Ok(QualifiedSignal {
        candidate,
        is_system_feedback,
        strength,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_session;
    use crate::signals::testing::*;
    use crate::signals::SignalDetails;
    use ufse_protocol::Event;

    fn abandonment() -> CandidateSignal {
        CandidateSignal {
            signal_type: SignalType::Abandonment,
            timestamp: t0(),
            route: "/checkout".to_string(),
            details: SignalDetails::Abandonment {
                flow_start: "navigation".to_string(),
                friction_type: "rejection".to_string(),
            },
        }
    }

    fn blocked() -> CandidateSignal {
        CandidateSignal {
            signal_type: SignalType::Blocked,
            timestamp: t0(),
            route: "/signup".to_string(),
            details: SignalDetails::Blocked {
                target_id: "signup".to_string(),
                action_type: "form_submit".to_string(),
                rejection_type: "javascript_error".to_string(),
                retry_count: 1,
            },
        }
    }

    fn run(candidate: CandidateSignal, events: Vec<Event>) -> Result<QualifiedSignal, QualificationFailure> {
        let session = session(events);
        let classified = classify_session(&session);
        qualify(candidate, &classified, &QualificationConfig::default())
    }

    #[test]
    fn abandonment_is_self_evident() {
        let qualified = run(
            abandonment(),
            vec![
                event("navigation", 0, "/checkout"),
                event("error", 5_000, "/checkout"),
            ],
        )
        .expect("qualified");
        assert!(qualified.is_system_feedback);
        assert!((qualified.strength - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn lone_event_is_isolated() {
        let result = run(abandonment(), vec![event("navigation", 0, "/checkout")]);
        assert_eq!(result, Err(QualificationFailure::Isolated));
    }

    #[test]
    fn blocked_needs_feedback_after_it() {
        let result = run(
            blocked(),
            vec![
                event("form_submit", 0, "/signup"),
                event("form_submit", 2_000, "/signup"),
                event("error", 12_000, "/signup"),
            ],
        );
        assert_eq!(result, Err(QualificationFailure::NoCause));
    }

    #[test]
    fn later_success_resolves_signal() {
        let result = run(
            blocked(),
            vec![
                event("form_submit", 0, "/signup"),
                event("error", 1_000, "/signup"),
                event("navigation", 8_000, "/signup").with_metadata("to", "/signup/complete"),
            ],
        );
        assert_eq!(result, Err(QualificationFailure::ResolvedLater));
    }

    #[test]
    fn success_after_window_does_not_resolve() {
        let qualified = run(
            blocked(),
            vec![
                event("form_submit", 0, "/signup"),
                event("error", 1_000, "/signup"),
                event("api_response", 45_000, "/signup").with_metadata("status", 200),
            ],
        )
        .expect("qualified");
        assert!(qualified.is_system_feedback);
    }
}
