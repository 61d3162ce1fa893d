use ufse_protocol::SeverityType;

use crate::correlate::CorrelatedGroup;
use crate::signals::{ConfusionKind, SignalDetails, SignalType};

pub fn classify_severity(group: &CorrelatedGroup) -> SeverityType {
    if group.has_type(SignalType::RageBait) {
        return SeverityType::DarkPattern;
    }
    if !group.has_system_feedback {
        return SeverityType::Ux;
    }
    let scroll_driven = group.signals.iter().any(|signal| {
        matches!(
            signal.candidate.details,
            SignalDetails::Confusion {
                confusion_type: ConfusionKind::ExcessiveScrolling,
                ..
            }
        )
    });
    if scroll_driven {
        SeverityType::Performance
    } else {
        SeverityType::Bug
    }
}
