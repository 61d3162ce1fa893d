//! Incident assembly. One incident per correlated group, built only from
//! fully resolved parts.

use chrono::{DateTime, Utc};
use ufse_protocol::{ConfidenceLevel, Incident, Session, SeverityType, SignalDetail};
use uuid::Uuid;

use crate::correlate::CorrelatedGroup;
use crate::failure_point::FailurePoint;
use crate::qualify::QualifiedSignal;

/// Everything an incident is made of, computed by the earlier stages.
#[derive(Debug, Clone)]
pub struct IncidentParts<'a> {
    pub session: &'a Session,
    pub group: &'a CorrelatedGroup,
    pub score: u8,
    pub confidence: ConfidenceLevel,
    pub severity: SeverityType,
    pub failure_point: &'a FailurePoint,
    pub explanation: String,
}

fn signal_detail(signal: &QualifiedSignal) -> SignalDetail {
    SignalDetail {
        signal_type: signal.signal_type().as_str().to_string(),
        timestamp: signal.timestamp(),
        route: signal.route().to_string(),
        strength: signal.strength,
        is_system_feedback: signal.is_system_feedback,
        details: signal.candidate.details.to_map(),
    }
}

pub fn assemble_incident(parts: IncidentParts<'_>, emitted_at: DateTime<Utc>) -> Incident {
    Incident {
        incident_id: Uuid::new_v4(),
        session_id: parts.session.session_id.clone(),
        project_id: parts.session.project_id.clone(),
        frustration_score: parts.score.min(100),
        confidence_level: parts.confidence,
        triggering_signals: parts
            .group
            .signal_types()
            .iter()
            .map(|signal_type| signal_type.as_str().to_string())
            .collect(),
        primary_failure_point: parts.failure_point.to_string(),
        severity_type: parts.severity,
        timestamp: emitted_at,
        explanation: parts.explanation,
        signal_details: parts.group.signals.iter().map(signal_detail).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::testing::{session, t0};
    use crate::signals::{CandidateSignal, SignalDetails, SignalType};

    #[test]
    fn incident_carries_group_evidence() {
        let session = session(Vec::new());
        let group = CorrelatedGroup::new(
            "/signup",
            vec![QualifiedSignal {
                candidate: CandidateSignal {
                    signal_type: SignalType::Blocked,
                    timestamp: t0(),
                    route: "/signup".to_string(),
                    details: SignalDetails::Blocked {
                        target_id: "signup".to_string(),
                        action_type: "form_submit".to_string(),
                        rejection_type: "http_error".to_string(),
                        retry_count: 1,
                    },
                },
                is_system_feedback: true,
                strength: 0.7,
            }],
        );
        let failure_point = FailurePoint {
            route: "/signup".to_string(),
            component: "signup".to_string(),
            action: "form_submit".to_string(),
        };
        let incident = assemble_incident(
            IncidentParts {
                session: &session,
                group: &group,
                score: 42,
                confidence: ConfidenceLevel::High,
                severity: SeverityType::Bug,
                failure_point: &failure_point,
                explanation: "because".to_string(),
            },
            t0(),
        );

        assert_eq!(incident.session_id, "session-1");
        assert_eq!(incident.project_id, "project-1");
        assert_eq!(incident.triggering_signals, vec!["blocked".to_string()]);
        assert_eq!(incident.primary_failure_point, "/signup:signup:form_submit");
        assert_eq!(incident.signal_details.len(), 1);
        assert_eq!(incident.signal_details[0].details["retryCount"], 1);
        assert_eq!(incident.idempotency_key(), "session-1:/signup:signup:form_submit");
    }
}
