//! False-alarm filter.
//!
//! Legitimate behaviour produces many of the same patterns frustration does:
//! double-clicks, assistive technology, games, search refinement, comparing
//! products. Whitelists and blacklists veto any candidate outright; context
//! checks veto specific signal types. Strong signals (high-tier rage, rage
//! bait) only go through the critical checks: bot traffic and double-clicks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use ufse_protocol::Session;

use crate::classify::ClassifiedEvent;
use crate::signals::{
    has_intentional_exit, navigation_destination, CandidateSignal, SignalDetails, SignalType,
};

const DOUBLE_CLICK_MAX_MS: i64 = 500;
const TRANSIENT_RECOVERY_LOOKAHEAD: usize = 10;
/// Rejections considered part of a blocked attempt: the retry window plus the
/// rejection window after the last retry.
const BLOCKED_CONTEXT_SECS: i64 = 60;

static ASSISTIVE_AGENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)screen ?reader|nvda|jaws|voiceover|talkback|orca|narrator").unwrap()
});
static BOT_AGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bot|crawler|spider|scraper|slurp|headless").unwrap());
static GAMING_ROUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|/)(game|games|play|gaming)(/|$)").unwrap());

const ASSISTIVE_METADATA_FLAGS: [&str; 2] = ["screenReader", "assistiveTechnology"];
const SEARCH_MARKERS: [&str; 2] = ["search", "filter"];
const PRODUCT_MARKERS: [&str; 2] = ["/product", "/compare"];
const INERT_TARGET_FLAGS: [&str; 4] = ["loading", "disabled", "isLoading", "isDisabled"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FalseAlarmReason {
    DoubleClick,
    AccessibilityTool,
    GamingRoute,
    SearchFilter,
    ComparisonShopping,
    BotTraffic,
    InertTarget,
    ValidationError,
    TransientRecovery,
    IntentionalExit,
}

impl FalseAlarmReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FalseAlarmReason::DoubleClick => "double_click",
            FalseAlarmReason::AccessibilityTool => "accessibility_tool",
            FalseAlarmReason::GamingRoute => "gaming_route",
            FalseAlarmReason::SearchFilter => "search_filter",
            FalseAlarmReason::ComparisonShopping => "comparison_shopping",
            FalseAlarmReason::BotTraffic => "bot_traffic",
            FalseAlarmReason::InertTarget => "inert_target",
            FalseAlarmReason::ValidationError => "validation_error",
            FalseAlarmReason::TransientRecovery => "transient_recovery",
            FalseAlarmReason::IntentionalExit => "intentional_exit",
        }
    }
}

impl fmt::Display for FalseAlarmReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate removed by the filter, with the matcher that vetoed it.
#[derive(Debug, Clone)]
pub struct Vetoed {
    pub candidate: CandidateSignal,
    pub reason: FalseAlarmReason,
}

/// Splits candidates into survivors and vetoed ones, preserving order.
pub fn filter_candidates(
    candidates: Vec<CandidateSignal>,
    events: &[ClassifiedEvent<'_>],
    session: &Session,
) -> (Vec<CandidateSignal>, Vec<Vetoed>) {
    let mut kept = Vec::with_capacity(candidates.len());
    let mut vetoed = Vec::new();
    for candidate in candidates {
        match false_alarm_reason(&candidate, events, session) {
            Some(reason) => {
                debug!(
                    session_id = %session.session_id,
                    signal_type = candidate.signal_type.as_str(),
                    route = %candidate.route,
                    reason = reason.as_str(),
                    "Candidate vetoed as false alarm"
                );
                vetoed.push(Vetoed { candidate, reason });
            }
            None => kept.push(candidate),
        }
    }
    (kept, vetoed)
}

pub fn false_alarm_reason(
    candidate: &CandidateSignal,
    events: &[ClassifiedEvent<'_>],
    session: &Session,
) -> Option<FalseAlarmReason> {
    if is_bot(session) {
        return Some(FalseAlarmReason::BotTraffic);
    }
    if is_double_click(candidate) {
        return Some(FalseAlarmReason::DoubleClick);
    }
    if candidate.is_high_tier_rage() || candidate.signal_type == SignalType::RageBait {
        return None;
    }
    whitelist_reason(candidate, events, session).or_else(|| context_reason(candidate, events))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_ascii_lowercase();
    needles.iter().any(|needle| haystack.contains(needle))
}

fn is_bot(session: &Session) -> bool {
    session
        .user_agent()
        .is_some_and(|agent| BOT_AGENT.is_match(agent))
}

// ─────────────────────────────────────────────────────────────────────────────
// Whitelist
// ─────────────────────────────────────────────────────────────────────────────

fn whitelist_reason(
    candidate: &CandidateSignal,
    events: &[ClassifiedEvent<'_>],
    session: &Session,
) -> Option<FalseAlarmReason> {
    if uses_assistive_technology(events, session) {
        return Some(FalseAlarmReason::AccessibilityTool);
    }
    if candidate.signal_type == SignalType::Rage && is_gaming_route(&candidate.route) {
        return Some(FalseAlarmReason::GamingRoute);
    }
    if is_search_or_filter(candidate, events) {
        return Some(FalseAlarmReason::SearchFilter);
    }
    if candidate.signal_type == SignalType::Confusion && is_comparison_shopping(events) {
        return Some(FalseAlarmReason::ComparisonShopping);
    }
    None
}

fn is_double_click(candidate: &CandidateSignal) -> bool {
    match candidate.details {
        SignalDetails::Rage {
            interaction_count,
            time_window_ms,
            ..
        } => interaction_count == 2 && time_window_ms < DOUBLE_CLICK_MAX_MS,
        _ => false,
    }
}

fn uses_assistive_technology(events: &[ClassifiedEvent<'_>], session: &Session) -> bool {
    if session
        .user_agent()
        .is_some_and(|agent| ASSISTIVE_AGENT.is_match(agent))
    {
        return true;
    }
    events.iter().any(|event| {
        ASSISTIVE_METADATA_FLAGS
            .iter()
            .any(|flag| event.event.metadata_flag(flag))
    })
}

fn is_gaming_route(route: &str) -> bool {
    GAMING_ROUTE.is_match(route)
}

fn is_search_or_filter(candidate: &CandidateSignal, events: &[ClassifiedEvent<'_>]) -> bool {
    if contains_any(&candidate.route, &SEARCH_MARKERS) {
        return true;
    }
    candidate.signal_type == SignalType::Confusion
        && events
            .iter()
            .filter(|event| event.is_navigation())
            .any(|event| contains_any(navigation_destination(event.event), &SEARCH_MARKERS))
}

/// At least two distinct product-like routes, each visited more than once.
fn is_comparison_shopping(events: &[ClassifiedEvent<'_>]) -> bool {
    let mut visits: HashMap<&str, usize> = HashMap::new();
    for event in events.iter().filter(|event| event.is_navigation()) {
        let destination = navigation_destination(event.event);
        if contains_any(destination, &PRODUCT_MARKERS) {
            *visits.entry(destination).or_default() += 1;
        }
    }
    visits.values().filter(|&&count| count >= 2).count() >= 2
}

// ─────────────────────────────────────────────────────────────────────────────
// Context checks
// ─────────────────────────────────────────────────────────────────────────────

fn context_reason(
    candidate: &CandidateSignal,
    events: &[ClassifiedEvent<'_>],
) -> Option<FalseAlarmReason> {
    match candidate.signal_type {
        SignalType::Rage if clicked_inert_target(candidate, events) => {
            Some(FalseAlarmReason::InertTarget)
        }
        SignalType::Blocked => blocked_context(candidate, events),
        SignalType::Abandonment if has_intentional_exit(events) => {
            Some(FalseAlarmReason::IntentionalExit)
        }
        _ => None,
    }
}

fn clicked_inert_target(candidate: &CandidateSignal, events: &[ClassifiedEvent<'_>]) -> bool {
    let Some(target) = candidate.target_id() else {
        return false;
    };
    events
        .iter()
        .filter(|event| {
            event.is_click()
                && event.route() == candidate.route
                && event.event.target.identity() == target
        })
        .any(|event| {
            INERT_TARGET_FLAGS
                .iter()
                .any(|flag| event.event.metadata_flag(flag))
        })
}

fn error_type(event: &ClassifiedEvent<'_>) -> Option<String> {
    event
        .event
        .metadata_str("errorType")
        .map(|value| value.to_ascii_lowercase())
}

fn blocked_context(
    candidate: &CandidateSignal,
    events: &[ClassifiedEvent<'_>],
) -> Option<FalseAlarmReason> {
    let until = candidate.timestamp + chrono::Duration::seconds(BLOCKED_CONTEXT_SECS);
    for (position, event) in events.iter().enumerate() {
        if event.timestamp < candidate.timestamp || event.timestamp > until {
            continue;
        }
        if !event.is_rejection() {
            continue;
        }
        match error_type(event).as_deref() {
            Some("validation") | Some("client_error") => {
                return Some(FalseAlarmReason::ValidationError)
            }
            Some("network") | Some("timeout") => {
                let recovered = events[position + 1..]
                    .iter()
                    .take(TRANSIENT_RECOVERY_LOOKAHEAD)
                    .any(|later| later.is_navigation() || later.is_success_response());
                if recovered {
                    return Some(FalseAlarmReason::TransientRecovery);
                }
            }
            _ => {}
        }
    }
    None
}
