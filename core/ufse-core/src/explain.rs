//! Human-readable justification for an incident.
//!
//! Four clauses are mandatory: what fired, why the signals correlated, why
//! confidence reached its level, and where the failure is. If any clause
//! cannot be written the incident is not emitted.

use ufse_protocol::ConfidenceLevel;

use crate::correlate::CorrelatedGroup;
use crate::failure_point::FailurePoint;

pub const REVIEW_PREFIX: &str = "[NEEDS REVIEW - Medium Confidence] ";

fn signals_clause(group: &CorrelatedGroup) -> Option<String> {
    let types = group.signal_types();
    if types.is_empty() {
        return None;
    }
    let names: Vec<&str> = types.iter().map(|signal_type| signal_type.as_str()).collect();
    Some(format!(
        "Detected {} signal{} ({})",
        group.len(),
        if group.len() == 1 { "" } else { "s" },
        names.join(", ")
    ))
}

fn correlation_clause(group: &CorrelatedGroup, window_secs: u64) -> Option<String> {
    if group.route.is_empty() {
        return None;
    }
    if group.len() == 1 {
        let strength = group.signals.first()?.strength;
        return Some(format!(
            "Correlated as a single strong signal (strength {:.2}) on {}",
            strength, group.route
        ));
    }
    let feedback = if group.has_system_feedback {
        "with"
    } else {
        "without"
    };
    Some(format!(
        "Correlated {} signals on {} within a {}s window {} system feedback",
        group.len(),
        group.route,
        window_secs,
        feedback
    ))
}

/// Only emittable levels can be justified; Low and empty groups yield `None`.
fn confidence_clause(group: &CorrelatedGroup, confidence: ConfidenceLevel) -> Option<String> {
    if group.signals.is_empty() {
        return None;
    }
    let average = group.average_strength();
    let reason = match confidence {
        ConfidenceLevel::High => format!(
            "{} distinct signal types with system feedback and a clear failure point",
            group.signal_types().len()
        ),
        ConfidenceLevel::Medium if group.len() == 1 => format!(
            "single signal with strength {:.2} and a clear failure point",
            average
        ),
        ConfidenceLevel::Medium => format!("average signal strength {:.2}", average),
        ConfidenceLevel::Low => return None,
    };
    Some(format!("{} confidence: {}", confidence, reason))
}

fn failure_point_clause(failure_point: &FailurePoint) -> Option<String> {
    if failure_point.route.is_empty() || failure_point.action.is_empty() {
        return None;
    }
    Some(format!("Primary failure point: {}", failure_point))
}

/// `None` when any clause cannot be generated.
pub fn explain(
    group: &CorrelatedGroup,
    confidence: ConfidenceLevel,
    failure_point: &FailurePoint,
    window_secs: u64,
) -> Option<String> {
    let clauses = [
        signals_clause(group)?,
        correlation_clause(group, window_secs)?,
        confidence_clause(group, confidence)?,
        failure_point_clause(failure_point)?,
    ];
    let body = clauses.join(". ");
    if confidence == ConfidenceLevel::Medium {
        Some(format!("{}{}", REVIEW_PREFIX, body))
    } else {
        Some(body)
    }
}
