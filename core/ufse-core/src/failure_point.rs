//! Primary failure point of a correlated group, formatted `route:component:action`.

use std::fmt;

use crate::correlate::CorrelatedGroup;
use crate::qualify::QualifiedSignal;
use crate::signals::{SignalDetails, SignalType};

const UNKNOWN_COMPONENT: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePoint {
    pub route: String,
    pub component: String,
    pub action: String,
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.route, self.component, self.action)
    }
}

/// Signal the failure point is attributed to: one with system feedback, else a
/// blocked signal, else the earliest.
fn primary_signal(group: &CorrelatedGroup) -> Option<&QualifiedSignal> {
    group
        .signals
        .iter()
        .find(|signal| signal.is_system_feedback)
        .or_else(|| {
            group
                .signals
                .iter()
                .find(|signal| signal.signal_type() == SignalType::Blocked)
        })
        .or_else(|| group.signals.iter().min_by_key(|signal| signal.timestamp()))
}

/// `None` means no signal can name the failure, which vetoes emission.
pub fn resolve_failure_point(group: &CorrelatedGroup) -> Option<FailurePoint> {
    let signal = primary_signal(group)?;
    let component = signal
        .candidate
        .target_id()
        .filter(|id| !id.is_empty())
        .unwrap_or(UNKNOWN_COMPONENT);
    let action = match &signal.candidate.details {
        SignalDetails::Blocked { action_type, .. } => action_type.as_str(),
        _ => signal.signal_type().as_str(),
    };
    Some(FailurePoint {
        route: signal.route().to_string(),
        component: component.to_string(),
        action: action.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::testing::t0;
    use crate::signals::{CandidateSignal, ConfusionKind};
    use chrono::Duration;

    fn qualified(offset_secs: i64, details: SignalDetails, feedback: bool) -> QualifiedSignal {
        let signal_type = match details {
            SignalDetails::Blocked { .. } => SignalType::Blocked,
            SignalDetails::Abandonment { .. } => SignalType::Abandonment,
            _ => SignalType::Confusion,
        };
        QualifiedSignal {
            candidate: CandidateSignal {
                signal_type,
                timestamp: t0() + Duration::seconds(offset_secs),
                route: "/signup".to_string(),
                details,
            },
            is_system_feedback: feedback,
            strength: 0.7,
        }
    }

    fn blocked() -> SignalDetails {
        SignalDetails::Blocked {
            target_id: "signup-form".to_string(),
            action_type: "form_submit".to_string(),
            rejection_type: "http_error".to_string(),
            retry_count: 1,
        }
    }

    fn confusion() -> SignalDetails {
        SignalDetails::Confusion {
            confusion_type: ConfusionKind::RouteOscillation,
            count: 4,
        }
    }

    #[test]
    fn feedback_signal_is_preferred() {
        let group = CorrelatedGroup::new(
            "/signup",
            vec![qualified(0, confusion(), false), qualified(5, blocked(), true)],
        );
        let point = resolve_failure_point(&group).expect("failure point");
        assert_eq!(point.to_string(), "/signup:signup-form:form_submit");
    }

    #[test]
    fn blocked_beats_earliest_without_feedback() {
        let group = CorrelatedGroup::new(
            "/signup",
            vec![qualified(0, confusion(), false), qualified(5, blocked(), false)],
        );
        assert_eq!(
            resolve_failure_point(&group).expect("failure point").action,
            "form_submit"
        );
    }

    #[test]
    fn earliest_signal_is_the_fallback() {
        let abandonment = SignalDetails::Abandonment {
            flow_start: "navigation".to_string(),
            friction_type: "rejection".to_string(),
        };
        let group = CorrelatedGroup::new(
            "/signup",
            vec![qualified(9, confusion(), false), qualified(3, abandonment, false)],
        );
        let point = resolve_failure_point(&group).expect("failure point");
        assert_eq!(point.to_string(), "/signup:unknown:abandonment");
    }

    #[test]
    fn empty_group_has_no_failure_point() {
        assert_eq!(resolve_failure_point(&CorrelatedGroup::new("/signup", Vec::new())), None);
    }
}
