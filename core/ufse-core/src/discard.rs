use serde::Serialize;
use std::fmt;

/// Why a session or correlated group produced no incident.
///
/// Every variant is terminal: the pipeline is deterministic, so the same input
/// always lands on the same reason and nothing is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    NoEvents,
    NoCandidates,
    QualificationFailed,
    CorrelationFailed,
    LowConfidence,
    AmbiguousFailurePoint,
    ExplanationFailed,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::NoEvents => "no_events",
            DiscardReason::NoCandidates => "no_candidates",
            DiscardReason::QualificationFailed => "qualification_failed",
            DiscardReason::CorrelationFailed => "correlation_failed",
            DiscardReason::LowConfidence => "low_confidence",
            DiscardReason::AmbiguousFailurePoint => "ambiguous_failure_point",
            DiscardReason::ExplanationFailed => "explanation_failed",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
