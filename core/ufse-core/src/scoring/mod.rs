//! Deterministic scoring of correlated groups: frustration score, confidence,
//! severity and time decay.

pub mod confidence;
pub mod decay;
pub mod score;
pub mod severity;

pub use confidence::{evaluate_confidence, has_clear_failure_point};
pub use decay::{effective_strength, effective_strengths};
pub use score::frustration_score;
pub use severity::classify_severity;
