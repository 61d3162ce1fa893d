//! Confusion: bouncing between two routes, or scrolling without getting anywhere.

use serde::Serialize;

use super::{
    navigation_destination, secs, CandidateSignal, DetectionContext, Detector, SignalDetails,
    SignalType,
};
use crate::classify::ClassifiedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfusionKind {
    RouteOscillation,
    ExcessiveScrolling,
}

impl ConfusionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfusionKind::RouteOscillation => "route_oscillation",
            ConfusionKind::ExcessiveScrolling => "excessive_scrolling",
        }
    }
}

pub struct ConfusionDetector;

impl Detector for ConfusionDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Confusion
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
        let mut signals = detect_oscillation(ctx);
        signals.extend(detect_scrolling(ctx));
        signals
    }
}

/// Counts returns to the route visited two steps earlier (A→B→A) inside a window.
fn count_oscillations(routes: &[&str]) -> usize {
    (2..routes.len())
        .filter(|&i| routes[i] != routes[i - 1] && routes[i] == routes[i - 2])
        .count()
}

fn detect_oscillation(ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
    let settings = &ctx.config.confusion;
    let window = secs(settings.oscillation_window_secs);
    let navigations: Vec<&ClassifiedEvent<'_>> =
        ctx.events.iter().filter(|event| event.is_navigation()).collect();
    let mut signals = Vec::new();

    let mut start = 0;
    while start < navigations.len() {
        let first = navigations[start];
        let end = navigations[start..]
            .iter()
            .take_while(|event| event.timestamp - first.timestamp <= window)
            .count()
            + start;
        let routes: Vec<&str> = navigations[start..end]
            .iter()
            .map(|event| navigation_destination(event.event))
            .collect();
        let oscillations = count_oscillations(&routes);
        if oscillations >= settings.oscillation_threshold {
            signals.push(CandidateSignal {
                signal_type: SignalType::Confusion,
                timestamp: first.timestamp,
                route: routes[0].to_string(),
                details: SignalDetails::Confusion {
                    confusion_type: ConfusionKind::RouteOscillation,
                    count: oscillations,
                },
            });
            start = end;
        } else {
            start += 1;
        }
    }
    signals
}

/// Anything that shows the user found what they were scrolling for.
fn is_progress(event: &ClassifiedEvent<'_>) -> bool {
    if event.is_click() {
        let tag = event.event.target.target_type.to_ascii_lowercase();
        return tag != "body" && tag != "html";
    }
    event.is_type("form_submit") || event.is_navigation()
}

fn detect_scrolling(ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
    let settings = &ctx.config.confusion;
    let window = secs(settings.scroll_window_secs);
    let mut signals = Vec::new();

    // Progress splits the session into independent stretches.
    for stretch in ctx.events.split(is_progress) {
        let scrolls: Vec<&ClassifiedEvent<'_>> =
            stretch.iter().filter(|event| event.is_type("scroll")).collect();
        let mut start = 0;
        while start < scrolls.len() {
            let first = scrolls[start];
            let count = scrolls[start..]
                .iter()
                .take_while(|event| event.timestamp - first.timestamp <= window)
                .count();
            if count >= settings.scroll_threshold {
                signals.push(CandidateSignal {
                    signal_type: SignalType::Confusion,
                    timestamp: first.timestamp,
                    route: first.route().to_string(),
                    details: SignalDetails::Confusion {
                        confusion_type: ConfusionKind::ExcessiveScrolling,
                        count,
                    },
                });
                start += count;
            } else {
                start += 1;
            }
        }
    }
    signals
}
