//! Frustration score (0-100).
//!
//! Additive and capped per term:
//!
//! | term     | points                                      | cap |
//! |----------|---------------------------------------------|-----|
//! | count    | 10 per live signal, weighted by strength    | 50  |
//! | type     | 20 × per-type weight per signal, weighted   | 30  |
//! | duration | 2 per minute spanned by the group           | 10  |
//! | feedback | flat bonus when system feedback is present  | 10  |
//! | bait     | flat bonus when rage bait is present        | 20  |
//!
//! The sum is scaled by average effective strength and clamped to 100.
//! Signals that decayed to stale no longer contribute.

use crate::config::{DecayConfig, SignalWeights};
use crate::correlate::CorrelatedGroup;
use crate::signals::SignalType;

use super::decay::effective_strengths;

const COUNT_POINTS: f64 = 10.0;
const COUNT_CAP: f64 = 50.0;
const TYPE_POINTS: f64 = 20.0;
const TYPE_CAP: f64 = 30.0;
const MINUTE_POINTS: f64 = 2.0;
const DURATION_CAP: f64 = 10.0;
const FEEDBACK_BONUS: f64 = 10.0;
const RAGE_BAIT_BONUS: f64 = 20.0;

fn strength_weighted(points: f64, strength: f64) -> f64 {
    points * (0.7 + 0.3 * strength)
}

pub fn frustration_score(
    group: &CorrelatedGroup,
    weights: &SignalWeights,
    decay: &DecayConfig,
) -> u8 {
    let live: Vec<(SignalType, f64)> = group
        .signals
        .iter()
        .zip(effective_strengths(group, decay))
        .filter_map(|(signal, strength)| strength.map(|value| (signal.signal_type(), value)))
        .collect();
    if live.is_empty() {
        return 0;
    }
    let average = live.iter().map(|(_, strength)| strength).sum::<f64>() / live.len() as f64;

    let count_term = (live.len() as f64 * strength_weighted(COUNT_POINTS, average)).min(COUNT_CAP);
    let type_term = live
        .iter()
        .map(|(signal_type, strength)| {
            strength_weighted(signal_type.weight(weights) * TYPE_POINTS, *strength)
        })
        .sum::<f64>()
        .min(TYPE_CAP);
    let minutes = group.duration().num_milliseconds() as f64 / 60_000.0;
    let duration_term = (minutes * MINUTE_POINTS).min(DURATION_CAP);

    let mut score = count_term + type_term + duration_term;
    if group.has_system_feedback {
        score += FEEDBACK_BONUS;
    }
    if group.has_type(SignalType::RageBait) {
        score += RAGE_BAIT_BONUS;
    }
    score *= 0.8 + 0.4 * average;
    score.clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierLevel;
    use crate::qualify::QualifiedSignal;
    use crate::signals::testing::t0;
    use crate::signals::{CandidateSignal, SignalDetails};
    use chrono::Duration;

    fn qualified(signal_type: SignalType, offset_secs: i64, strength: f64, feedback: bool) -> QualifiedSignal {
        let details = match signal_type {
            SignalType::Blocked => SignalDetails::Blocked {
                target_id: "pay".to_string(),
                action_type: "form_submit".to_string(),
                rejection_type: "http_error".to_string(),
                retry_count: 1,
            },
            _ => SignalDetails::Rage {
                target_id: "pay".to_string(),
                interaction_count: 5,
                time_window_ms: 400,
                tier: TierLevel::High,
                strength_score: strength,
            },
        };
        QualifiedSignal {
            candidate: CandidateSignal {
                signal_type,
                timestamp: t0() + Duration::seconds(offset_secs),
                route: "/pay".to_string(),
                details,
            },
            is_system_feedback: feedback,
            strength,
        }
    }

    #[test]
    fn single_strong_rage_with_feedback() {
        // live strength 1.0 (0.9 boosted): count 10, type 6, feedback 10, × 1.2
        let group = CorrelatedGroup::new("/pay", vec![qualified(SignalType::Rage, 0, 0.9, true)]);
        let score = frustration_score(&group, &SignalWeights::default(), &DecayConfig::default());
        assert_eq!(score, 31);
    }

    #[test]
    fn more_signals_score_higher() {
        let weights = SignalWeights::default();
        let decay = DecayConfig::default();
        let single = CorrelatedGroup::new("/pay", vec![qualified(SignalType::Blocked, 0, 0.7, true)]);
        let pair = CorrelatedGroup::new(
            "/pay",
            vec![
                qualified(SignalType::Blocked, 0, 0.7, true),
                qualified(SignalType::Rage, 5, 0.9, false),
            ],
        );
        assert!(frustration_score(&pair, &weights, &decay) > frustration_score(&single, &weights, &decay));
    }

    #[test]
    fn score_is_capped_at_100() {
        let signals = (0..20)
            .map(|i| qualified(SignalType::Rage, i, 1.0, true))
            .collect();
        let group = CorrelatedGroup::new("/pay", signals);
        let score = frustration_score(&group, &SignalWeights::default(), &DecayConfig::default());
        assert!(score <= 100);
    }

    #[test]
    fn score_is_deterministic() {
        let group = CorrelatedGroup::new(
            "/pay",
            vec![
                qualified(SignalType::Blocked, 0, 0.7, true),
                qualified(SignalType::Rage, 20, 0.9, false),
            ],
        );
        let weights = SignalWeights::default();
        let decay = DecayConfig::default();
        assert_eq!(
            frustration_score(&group, &weights, &decay),
            frustration_score(&group.clone(), &weights, &decay)
        );
    }
}
