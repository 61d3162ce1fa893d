use ufse_protocol::ConfidenceLevel;

use crate::correlate::CorrelatedGroup;
use crate::signals::SignalType;

const MEDIUM_AVERAGE_STRENGTH: f64 = 0.7;

/// A group points at a concrete failure when it has system feedback, or
/// contains a signal that carries its own cause.
pub fn has_clear_failure_point(group: &CorrelatedGroup) -> bool {
    group.has_system_feedback
        || group.signals.iter().any(|signal| {
            matches!(signal.signal_type(), SignalType::Blocked | SignalType::RageBait)
                || signal.candidate.is_high_tier_rage()
        })
}

pub fn evaluate_confidence(
    group: &CorrelatedGroup,
    single_signal_threshold: f64,
) -> ConfidenceLevel {
    match group.signals.as_slice() {
        [] => ConfidenceLevel::Low,
        [single] => {
            if single.strength >= single_signal_threshold && has_clear_failure_point(group) {
                ConfidenceLevel::Medium
            } else {
                ConfidenceLevel::Low
            }
        }
        _ => {
            if group.has_system_feedback && group.signal_types().len() >= 2 {
                ConfidenceLevel::High
            } else if group.average_strength() >= MEDIUM_AVERAGE_STRENGTH {
                ConfidenceLevel::Medium
            } else {
                ConfidenceLevel::Low
            }
        }
    }
}
