//! Candidate signal detection.
//!
//! Each detector is an independent pattern matcher over the classified events
//! of one completed session; their outputs are unioned. Detectors only propose
//! candidates: false-alarm filtering, qualification and correlation decide
//! whether anything becomes an incident.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use ufse_protocol::{Event, Session};

use crate::classify::ClassifiedEvent;
use crate::config::{ClickRunThresholds, DetectionConfig, SignalWeights, TierLevel};
use crate::routes::{MergedRouteConfig, RouteConfigManager};

pub mod abandonment;
pub mod blocked;
pub mod confusion;
pub mod form_loop;
pub mod rage;
pub mod rage_bait;

pub use abandonment::AbandonmentDetector;
pub use blocked::BlockedDetector;
pub use confusion::{ConfusionDetector, ConfusionKind};
pub use form_loop::{FormLoopDetector, LoopKind};
pub use rage::RageDetector;
pub use rage_bait::{DarkPatternIndicator, RageBaitDetector};

const COMPLETION_ROUTE_MARKERS: [&str; 5] =
    ["success", "thank", "complete", "confirmation", "receipt"];
const INTENTIONAL_EXIT_FLAGS: [&str; 3] = ["external", "share", "bookmark"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Rage,
    RageBait,
    Blocked,
    Abandonment,
    Confusion,
    FormLoop,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Rage => "rage",
            SignalType::RageBait => "rage_bait",
            SignalType::Blocked => "blocked",
            SignalType::Abandonment => "abandonment",
            SignalType::Confusion => "confusion",
            SignalType::FormLoop => "form_loop",
        }
    }

    pub fn weight(self, weights: &SignalWeights) -> f64 {
        match self {
            SignalType::Rage => weights.rage,
            SignalType::RageBait => weights.rage_bait,
            SignalType::Blocked => weights.blocked,
            SignalType::Abandonment => weights.abandonment,
            SignalType::Confusion => weights.confusion,
            SignalType::FormLoop => weights.form_loop,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector-specific evidence carried by a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum SignalDetails {
    Rage {
        target_id: String,
        interaction_count: usize,
        time_window_ms: i64,
        tier: TierLevel,
        strength_score: f64,
    },
    RageBait {
        target_id: String,
        click_count: usize,
        dark_pattern_score: f64,
        indicators: Vec<DarkPatternIndicator>,
    },
    Blocked {
        target_id: String,
        action_type: String,
        rejection_type: String,
        retry_count: usize,
    },
    Abandonment {
        flow_start: String,
        friction_type: String,
    },
    Confusion {
        confusion_type: ConfusionKind,
        count: usize,
    },
    FormLoop {
        form_id: String,
        submission_count: usize,
        loop_type: LoopKind,
        signal_strength: f64,
    },
}

impl SignalDetails {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSignal {
    pub signal_type: SignalType,
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub details: SignalDetails,
}

impl CandidateSignal {
    /// Strength used for single-signal correlation and scoring. High-tier rage
    /// and rage bait are strong by construction.
    pub fn strength(&self) -> f64 {
        let strength = match &self.details {
            SignalDetails::Rage {
                tier: TierLevel::High,
                strength_score,
                ..
            } => strength_score.max(0.9),
            SignalDetails::Rage { strength_score, .. } => *strength_score,
            SignalDetails::RageBait {
                dark_pattern_score, ..
            } => dark_pattern_score.max(0.8),
            SignalDetails::Blocked { .. } => 0.7,
            SignalDetails::Abandonment { .. } => 0.5,
            SignalDetails::Confusion { .. } => 0.3,
            SignalDetails::FormLoop {
                signal_strength, ..
            } => *signal_strength,
        };
        strength.clamp(0.0, 1.0)
    }

    pub fn target_id(&self) -> Option<&str> {
        match &self.details {
            SignalDetails::Rage { target_id, .. }
            | SignalDetails::RageBait { target_id, .. }
            | SignalDetails::Blocked { target_id, .. } => Some(target_id.as_str()),
            SignalDetails::FormLoop { form_id, .. } => Some(form_id.as_str()),
            SignalDetails::Abandonment { .. } | SignalDetails::Confusion { .. } => None,
        }
    }

    pub fn is_high_tier_rage(&self) -> bool {
        matches!(
            self.details,
            SignalDetails::Rage {
                tier: TierLevel::High,
                ..
            }
        )
    }
}

/// Everything a detector may look at for one session.
pub struct DetectionContext<'a> {
    pub session: &'a Session,
    pub events: &'a [ClassifiedEvent<'a>],
    pub config: &'a DetectionConfig,
    pub routes: &'a RouteConfigManager,
}

impl<'a> DetectionContext<'a> {
    pub fn route_config(&self, route: &str) -> MergedRouteConfig {
        self.routes.resolve(route, self.config)
    }
}

pub trait Detector: Send + Sync {
    fn signal_type(&self) -> SignalType;
    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal>;
}

pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(RageDetector),
        Box::new(RageBaitDetector),
        Box::new(BlockedDetector),
        Box::new(AbandonmentDetector),
        Box::new(ConfusionDetector),
        Box::new(FormLoopDetector),
    ]
}

/// Runs every detector and returns the union ordered by time.
pub fn detect_candidates(
    detectors: &[Box<dyn Detector>],
    ctx: &DetectionContext<'_>,
) -> Vec<CandidateSignal> {
    let mut candidates: Vec<CandidateSignal> = detectors
        .iter()
        .flat_map(|detector| detector.detect(ctx))
        .collect();
    candidates.sort_by_key(|candidate| candidate.timestamp);
    candidates
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared matching helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Clicks grouped by (route, target identity), in first-seen order.
pub(crate) fn clicks_by_target<'a>(
    events: &[ClassifiedEvent<'a>],
) -> Vec<(String, Vec<ClassifiedEvent<'a>>)> {
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<ClassifiedEvent<'a>>)> = Vec::new();
    for event in events.iter().filter(|event| event.is_click()) {
        let key = (event.route(), event.event.target.identity());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((key.1.to_string(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(*event);
    }
    groups
}

/// First run of clicks meeting `thresholds` that `accept` approves. Runs are
/// extended as far as the gap and window allow before being offered.
pub(crate) fn find_click_run<'c, 'a>(
    clicks: &'c [ClassifiedEvent<'a>],
    thresholds: &ClickRunThresholds,
    mut accept: impl FnMut(&[ClassifiedEvent<'a>]) -> bool,
) -> Option<&'c [ClassifiedEvent<'a>]> {
    let window = thresholds.time_window();
    let max_gap = thresholds.max_gap();
    for start in 0..clicks.len() {
        let mut end = start;
        while end + 1 < clicks.len() {
            let next = &clicks[end + 1];
            if next.timestamp - clicks[end].timestamp > max_gap
                || next.timestamp - clicks[start].timestamp > window
            {
                break;
            }
            end += 1;
        }
        let run = &clicks[start..=end];
        if run.len() >= thresholds.min_clicks && accept(run) {
            return Some(run);
        }
    }
    None
}

pub(crate) fn navigation_destination(event: &Event) -> &str {
    event
        .metadata_str("to")
        .filter(|to| !to.is_empty())
        .unwrap_or(event.route.as_str())
}

/// Navigation to another route or a 2xx response strictly inside (start, end).
pub(crate) fn has_success_feedback(
    events: &[ClassifiedEvent<'_>],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    route: &str,
) -> bool {
    events
        .iter()
        .filter(|event| event.timestamp > start && event.timestamp < end)
        .any(|event| {
            (event.is_navigation() && navigation_destination(event.event) != route)
                || event.is_success_response()
        })
}

pub(crate) fn is_completion_route(route: &str) -> bool {
    let route = route.to_ascii_lowercase();
    COMPLETION_ROUTE_MARKERS
        .iter()
        .any(|marker| route.contains(marker))
}

/// Navigation flagged as external, share or bookmark anywhere in the session.
pub(crate) fn has_intentional_exit(events: &[ClassifiedEvent<'_>]) -> bool {
    events
        .iter()
        .filter(|event| event.is_navigation())
        .any(|event| {
            INTENTIONAL_EXIT_FLAGS
                .iter()
                .any(|flag| event.event.metadata_flag(flag))
        })
}

pub(crate) fn span_ms(run: &[ClassifiedEvent<'_>]) -> i64 {
    match (run.first(), run.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_milliseconds(),
        _ => 0,
    }
}

pub(crate) fn secs(value: u64) -> Duration {
    crate::config::bounded_secs(value)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Event builders shared by the detector tests.

    use super::*;
    use crate::classify::classify_session;
    use ufse_protocol::{parse_timestamp, Target};

    pub fn t0() -> DateTime<Utc> {
        parse_timestamp("2026-01-30T12:00:00Z").expect("t0")
    }

    pub fn at(offset_ms: i64) -> String {
        (t0() + Duration::milliseconds(offset_ms)).to_rfc3339()
    }

    pub fn event(event_type: &str, offset_ms: i64, route: &str) -> Event {
        Event::new(event_type, at(offset_ms), "session-1", route)
    }

    pub fn click(offset_ms: i64, route: &str, target_type: &str, id: &str) -> Event {
        event("click", offset_ms, route).with_target(Target::new(target_type).with_id(id))
    }

    pub fn session(events: Vec<Event>) -> Session {
        Session::from_events("session-1", "project-1", events)
    }

    pub fn run_detector(detector: &dyn Detector, session: &Session) -> Vec<CandidateSignal> {
        run_detector_with(detector, session, &DetectionConfig::default())
    }

    pub fn run_detector_with(
        detector: &dyn Detector,
        session: &Session,
        config: &DetectionConfig,
    ) -> Vec<CandidateSignal> {
        let routes = RouteConfigManager::from_config(config).expect("routes");
        let events = classify_session(session);
        let ctx = DetectionContext {
            session,
            events: &events,
            config,
            routes: &routes,
        };
        detector.detect(&ctx)
    }
}
