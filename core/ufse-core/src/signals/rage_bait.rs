//! Rage bait: click runs on elements that invite clicks and then ignore them.
//!
//! The run search is the same as rage; what differs is the scoring. Each
//! indicator family adds a fixed amount to a dark-pattern score capped at 1.

use serde::Serialize;

use super::{
    clicks_by_target, find_click_run, has_success_feedback, CandidateSignal, DetectionContext,
    Detector, SignalDetails, SignalType,
};
use crate::classify::ClassifiedEvent;
use chrono::Duration;

const NON_INTERACTIVE_TAGS: [&str; 10] =
    ["div", "span", "p", "h1", "h2", "h3", "h4", "h5", "h6", "img"];
const CONTENT_TAGS: [&str; 7] = ["article", "div", "span", "p", "h1", "h2", "h3"];
const INTERACTIVE_TAGS: [&str; 4] = ["button", "a", "input", "select"];
const MISLEADING_SELECTOR_MARKERS: [&str; 6] =
    ["fake-button", "fake-link", "deceptive", "misleading", "trick", "bait"];
const EXIT_ROUTE_MARKERS: [&str; 4] = ["/cancel", "/exit", "/close", "/back"];
const RESPONSE_GRACE_MS: i64 = 2_000;
const REPEATED_CLICKS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DarkPatternIndicator {
    NonInteractiveClickable,
    MisleadingElement,
    RoachMotel,
    Misdirection,
    ForcedContinuity,
    SneakIntoBasket,
    Clickbait,
    UnresponsiveElement,
}

impl DarkPatternIndicator {
    fn is_signature(self) -> bool {
        matches!(
            self,
            DarkPatternIndicator::RoachMotel
                | DarkPatternIndicator::Misdirection
                | DarkPatternIndicator::ForcedContinuity
                | DarkPatternIndicator::SneakIntoBasket
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DarkPatternAssessment {
    pub indicators: Vec<DarkPatternIndicator>,
    /// Independent indicator families; signatures count once.
    pub families: usize,
    pub score: f64,
}

pub struct RageBaitDetector;

impl Detector for RageBaitDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::RageBait
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
        let settings = &ctx.config.rage_bait;
        if !settings.enabled {
            return Vec::new();
        }
        let thresholds = settings.thresholds();
        let mut signals = Vec::new();

        for (target_id, clicks) in clicks_by_target(ctx.events) {
            let Some(first) = clicks.first() else {
                continue;
            };
            let route = first.route();
            let mut assessment = None;
            let run = find_click_run(&clicks, &thresholds, |run| {
                let candidate = assess(run, ctx.events);
                let strong = candidate.score >= settings.min_dark_pattern_score;
                let qualifies = candidate.families >= settings.min_indicators || strong;
                let resolved = has_success_feedback(
                    ctx.events,
                    run[0].timestamp,
                    run[run.len() - 1].timestamp,
                    route,
                );
                if qualifies && (strong || !resolved) {
                    assessment = Some(candidate);
                    return true;
                }
                false
            });
            let (Some(run), Some(assessment)) = (run, assessment) else {
                continue;
            };
            signals.push(CandidateSignal {
                signal_type: SignalType::RageBait,
                timestamp: run[0].timestamp,
                route: route.to_string(),
                details: SignalDetails::RageBait {
                    target_id,
                    click_count: run.len(),
                    dark_pattern_score: assessment.score,
                    indicators: assessment.indicators,
                },
            });
        }
        signals
    }
}

/// Scores one click run against the session it belongs to.
pub fn assess(
    run: &[ClassifiedEvent<'_>],
    events: &[ClassifiedEvent<'_>],
) -> DarkPatternAssessment {
    let mut indicators = Vec::new();
    let Some(first) = run.first() else {
        return DarkPatternAssessment {
            indicators,
            families: 0,
            score: 0.0,
        };
    };
    let target = &first.event.target;
    let tag = target.target_type.to_ascii_lowercase();
    let route = first.route().to_ascii_lowercase();

    if NON_INTERACTIVE_TAGS.contains(&tag.as_str())
        && run
            .iter()
            .any(|click| click.event.metadata_str("cursor") == Some("pointer"))
    {
        indicators.push(DarkPatternIndicator::NonInteractiveClickable);
    }

    let selector = target.selector.as_deref().unwrap_or("").to_ascii_lowercase();
    let misleading_metadata = run.iter().any(|click| {
        let event = click.event;
        (event.metadata_flag("looksLikeButton") && !event.metadata_flag("isButton"))
            || (event.metadata_flag("isLink") && event.metadata_flag("isDeceptive"))
    });
    if misleading_metadata
        || MISLEADING_SELECTOR_MARKERS
            .iter()
            .any(|marker| selector.contains(marker))
    {
        indicators.push(DarkPatternIndicator::MisleadingElement);
    }

    indicators.extend(signatures(run, events, &route));

    if CONTENT_TAGS.contains(&tag.as_str()) && run.len() >= REPEATED_CLICKS {
        indicators.push(DarkPatternIndicator::Clickbait);
    }

    if INTERACTIVE_TAGS.contains(&tag.as_str())
        && run.len() >= REPEATED_CLICKS
        && !has_response(run, events)
    {
        indicators.push(DarkPatternIndicator::UnresponsiveElement);
    }

    let has_signature = indicators.iter().any(|indicator| indicator.is_signature());
    let mut score = 0.0;
    let mut families = 0;
    for indicator in &indicators {
        let weight = match indicator {
            DarkPatternIndicator::NonInteractiveClickable => 0.3,
            DarkPatternIndicator::MisleadingElement => 0.3,
            DarkPatternIndicator::Clickbait => 0.2,
            DarkPatternIndicator::UnresponsiveElement => 0.3,
            _ => continue,
        };
        score += weight;
        families += 1;
    }
    if has_signature {
        score += 0.4;
        families += 1;
    }

    DarkPatternAssessment {
        indicators,
        families,
        score: f64::min(score, 1.0),
    }
}

fn signatures(
    run: &[ClassifiedEvent<'_>],
    events: &[ClassifiedEvent<'_>],
    route: &str,
) -> Vec<DarkPatternIndicator> {
    let mut found = Vec::new();
    let clicks_where = |predicate: &dyn Fn(&str) -> bool| {
        events
            .iter()
            .filter(|event| event.is_click() && predicate(&event.route().to_ascii_lowercase()))
            .count()
    };

    if EXIT_ROUTE_MARKERS.iter().any(|marker| route.contains(marker))
        && clicks_where(&|candidate| candidate == route) >= REPEATED_CLICKS
    {
        found.push(DarkPatternIndicator::RoachMotel);
    }

    if run
        .iter()
        .any(|click| click.event.metadata_flag("isDistracting"))
    {
        found.push(DarkPatternIndicator::Misdirection);
    }

    if (route.contains("cancel") || route.contains("unsubscribe"))
        && clicks_where(&|candidate| candidate.contains("cancel")) >= REPEATED_CLICKS
    {
        found.push(DarkPatternIndicator::ForcedContinuity);
    }

    if route.contains("cart") || route.contains("basket") {
        let added = events
            .iter()
            .filter(|event| {
                let identity = event.event.target.identity().to_ascii_lowercase();
                event.is_click() && (identity.contains("add") || identity.contains("cart"))
            })
            .count();
        let listed = events
            .iter()
            .filter(|event| event.is_navigation())
            .filter_map(|event| event.event.metadata_f64("itemCount"))
            .fold(0.0_f64, f64::max);
        if listed > added as f64 {
            found.push(DarkPatternIndicator::SneakIntoBasket);
        }
    }

    found
}

/// Navigation or network activity between the first click and shortly after the last.
fn has_response(run: &[ClassifiedEvent<'_>], events: &[ClassifiedEvent<'_>]) -> bool {
    let (Some(first), Some(last)) = (run.first(), run.last()) else {
        return false;
    };
    let until = last.timestamp + Duration::milliseconds(RESPONSE_GRACE_MS);
    events
        .iter()
        .filter(|event| event.timestamp >= first.timestamp && event.timestamp <= until)
        .any(|event| {
            event.is_navigation()
                || event.is_type("network_success")
                || event.is_type("network_error")
                || event.event.http_status().is_some()
        })
}
