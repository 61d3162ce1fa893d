//! Correlation of qualified signals into incident candidates.
//!
//! Signals are grouped per route and then by sliding windows. A group is
//! valid when it has two or more signals with at least one system-feedback
//! signal, or exactly one signal strong enough to stand alone. Overlapping
//! groups on the same route merge as long as the merged group stays valid.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

use crate::config::{bounded_secs, CorrelationConfig};
use crate::qualify::QualifiedSignal;
use crate::signals::SignalType;

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedGroup {
    pub signals: Vec<QualifiedSignal>,
    pub route: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub has_system_feedback: bool,
}

impl CorrelatedGroup {
    pub fn new(route: impl Into<String>, mut signals: Vec<QualifiedSignal>) -> Self {
        signals.sort_by_key(|signal| signal.timestamp());
        let window_start = signals
            .first()
            .map(QualifiedSignal::timestamp)
            .unwrap_or_default();
        let window_end = signals
            .last()
            .map(QualifiedSignal::timestamp)
            .unwrap_or(window_start);
        let has_system_feedback = signals.iter().any(|signal| signal.is_system_feedback);
        Self {
            signals,
            route: route.into(),
            window_start,
            window_end,
            has_system_feedback,
        }
    }

    pub fn is_valid(&self, single_signal_threshold: f64) -> bool {
        is_valid_set(
            self.signals.len(),
            self.has_system_feedback,
            self.signals.first().map(|signal| signal.strength),
            single_signal_threshold,
        )
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Signal types in order of first appearance.
    pub fn signal_types(&self) -> Vec<SignalType> {
        let mut types = Vec::new();
        for signal in &self.signals {
            if !types.contains(&signal.signal_type()) {
                types.push(signal.signal_type());
            }
        }
        types
    }

    pub fn has_type(&self, signal_type: SignalType) -> bool {
        self.signals
            .iter()
            .any(|signal| signal.signal_type() == signal_type)
    }

    pub fn average_strength(&self) -> f64 {
        if self.signals.is_empty() {
            return 0.0;
        }
        self.signals.iter().map(|signal| signal.strength).sum::<f64>() / self.signals.len() as f64
    }

    pub fn duration(&self) -> Duration {
        self.window_end - self.window_start
    }
}

fn is_valid_set(
    len: usize,
    has_feedback: bool,
    single_strength: Option<f64>,
    threshold: f64,
) -> bool {
    match len {
        0 => false,
        1 => single_strength.is_some_and(|strength| strength >= threshold),
        _ => has_feedback,
    }
}

/// Members of one candidate group, by index into the route's signals.
struct Window {
    members: BTreeSet<usize>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Window {
    fn new(members: BTreeSet<usize>, signals: &[&QualifiedSignal], span: Duration) -> Self {
        let timestamps = members.iter().map(|&index| signals[index].timestamp());
        let start = timestamps.clone().min().unwrap_or_default();
        let end = timestamps.max().unwrap_or(start) + span;
        Self {
            members,
            start,
            end,
        }
    }

    fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn is_valid(&self, signals: &[&QualifiedSignal], threshold: f64) -> bool {
        let has_feedback = self
            .members
            .iter()
            .any(|&index| signals[index].is_system_feedback);
        let single = self
            .members
            .iter()
            .next()
            .map(|&index| signals[index].strength);
        is_valid_set(self.members.len(), has_feedback, single, threshold)
    }
}

/// Groups `signals` into valid correlated groups. Signals that fit no valid
/// group are left out.
pub fn correlate(signals: &[QualifiedSignal], config: &CorrelationConfig) -> Vec<CorrelatedGroup> {
    let span = bounded_secs(config.time_window_secs);
    let threshold = config.single_signal_strength_threshold;

    let mut routes: Vec<(&str, Vec<&QualifiedSignal>)> = Vec::new();
    for signal in signals {
        match routes.iter_mut().find(|(route, _)| *route == signal.route()) {
            Some((_, members)) => members.push(signal),
            None => routes.push((signal.route(), vec![signal])),
        }
    }

    let mut groups = Vec::new();
    for (route, mut members) in routes {
        members.sort_by_key(|signal| signal.timestamp());

        let mut windows: Vec<Window> = Vec::new();
        for (start, first) in members.iter().enumerate() {
            let sliding: BTreeSet<usize> = (start..members.len())
                .take_while(|&index| members[index].timestamp() - first.timestamp() <= span)
                .collect();
            let window = Window::new(sliding, &members, span);
            if window.members.len() >= 2 && window.is_valid(&members, threshold) {
                windows.push(window);
            }
            if first.strength >= threshold {
                windows.push(Window::new(BTreeSet::from([start]), &members, span));
            }
        }

        for window in merge_windows(windows, &members, span, threshold) {
            let signals = window
                .members
                .iter()
                .map(|&index| members[index].clone())
                .collect();
            groups.push(CorrelatedGroup::new(route, signals));
        }
    }
    groups.sort_by_key(|group| group.window_start);
    groups
}

fn merge_windows(
    mut windows: Vec<Window>,
    signals: &[&QualifiedSignal],
    span: Duration,
    threshold: f64,
) -> Vec<Window> {
    'restart: loop {
        for a in 0..windows.len() {
            for b in a + 1..windows.len() {
                if !windows[a].overlaps(&windows[b]) {
                    continue;
                }
                let members: BTreeSet<usize> = windows[a]
                    .members
                    .union(&windows[b].members)
                    .copied()
                    .collect();
                let merged = Window::new(members, signals, span);
                if !merged.is_valid(signals, threshold) {
                    continue;
                }
                windows[a] = merged;
                windows.remove(b);
                continue 'restart;
            }
        }
        return windows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierLevel;
    use crate::signals::testing::t0;
    use crate::signals::{CandidateSignal, SignalDetails};

    fn signal(
        signal_type: SignalType,
        offset_secs: i64,
        route: &str,
        strength: f64,
        feedback: bool,
    ) -> QualifiedSignal {
        let details = match signal_type {
            SignalType::Rage => SignalDetails::Rage {
                target_id: "btn".to_string(),
                interaction_count: 4,
                time_window_ms: 300,
                tier: TierLevel::Medium,
                strength_score: strength,
            },
            _ => SignalDetails::Confusion {
                confusion_type: crate::signals::ConfusionKind::RouteOscillation,
                count: 4,
            },
        };
        QualifiedSignal {
            candidate: CandidateSignal {
                signal_type,
                timestamp: t0() + Duration::seconds(offset_secs),
                route: route.to_string(),
                details,
            },
            is_system_feedback: feedback,
            strength,
        }
    }

    fn correlate_default(signals: &[QualifiedSignal]) -> Vec<CorrelatedGroup> {
        correlate(signals, &CorrelationConfig::default())
    }

    #[test]
    fn pair_with_feedback_forms_group() {
        let groups = correlate_default(&[
            signal(SignalType::Rage, 0, "/pay", 0.5, true),
            signal(SignalType::Confusion, 10, "/pay", 0.3, false),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        assert!(groups[0].has_system_feedback);
        assert_eq!(groups[0].duration(), Duration::seconds(10));
    }

    #[test]
    fn pair_without_feedback_is_dropped() {
        let groups = correlate_default(&[
            signal(SignalType::Rage, 0, "/pay", 0.5, false),
            signal(SignalType::Confusion, 10, "/pay", 0.3, false),
        ]);
        assert!(groups.is_empty());
    }

    #[test]
    fn strong_single_signal_stands_alone() {
        let groups = correlate_default(&[signal(SignalType::Rage, 0, "/pay", 0.9, false)]);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_valid(0.8));

        let weak = correlate_default(&[signal(SignalType::Rage, 0, "/pay", 0.79, true)]);
        assert!(weak.is_empty());
    }

    #[test]
    fn oversized_window_is_clamped() {
        let config = CorrelationConfig {
            time_window_secs: u64::MAX / 2,
            ..CorrelationConfig::default()
        };
        let groups = correlate(
            &[
                signal(SignalType::Rage, 0, "/pay", 0.5, true),
                signal(SignalType::Confusion, 3_600, "/pay", 0.3, false),
            ],
            &config,
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn routes_are_correlated_separately() {
        let groups = correlate_default(&[
            signal(SignalType::Rage, 0, "/pay", 0.5, true),
            signal(SignalType::Confusion, 5, "/home", 0.3, true),
        ]);
        assert!(groups.is_empty());
    }

    #[test]
    fn overlapping_windows_merge() {
        let groups = correlate_default(&[
            signal(SignalType::Rage, 0, "/pay", 0.5, true),
            signal(SignalType::Confusion, 20, "/pay", 0.3, false),
            signal(SignalType::Rage, 45, "/pay", 0.5, true),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn strong_singles_without_feedback_stay_apart() {
        let groups = correlate_default(&[
            signal(SignalType::Rage, 0, "/pay", 0.9, false),
            signal(SignalType::Rage, 5, "/pay", 0.95, false),
        ]);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|group| group.len() == 1));
    }

    #[test]
    fn distant_windows_do_not_merge() {
        let groups = correlate_default(&[
            signal(SignalType::Rage, 0, "/pay", 0.5, true),
            signal(SignalType::Confusion, 5, "/pay", 0.3, false),
            signal(SignalType::Rage, 120, "/pay", 0.5, true),
            signal(SignalType::Confusion, 125, "/pay", 0.3, false),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn every_group_is_valid() {
        let signals: Vec<QualifiedSignal> = (0..12)
            .map(|i| {
                signal(
                    if i % 2 == 0 { SignalType::Rage } else { SignalType::Confusion },
                    i * 7,
                    "/pay",
                    (i as f64 * 0.09) % 1.0,
                    i % 5 == 0,
                )
            })
            .collect();
        for group in correlate_default(&signals) {
            assert!(group.is_valid(0.8));
        }
    }
}
