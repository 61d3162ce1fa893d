//! Abandonment: a purchase-like flow starts, hits friction, and never completes.

use super::{
    has_intentional_exit, is_completion_route, navigation_destination, secs, CandidateSignal,
    DetectionContext, Detector, SignalDetails, SignalType,
};
use crate::classify::{ClassifiedEvent, EventCategory};
use std::collections::HashSet;

const FLOW_ROUTE_MARKERS: [&str; 6] = ["checkout", "payment", "purchase", "buy", "cart", "order"];

pub struct AbandonmentDetector;

/// Route the flow runs on, when `event` starts one.
fn flow_route<'a>(event: &ClassifiedEvent<'a>) -> Option<&'a str> {
    if event.is_type("form_submit") {
        return Some(event.route());
    }
    if !event.is_navigation() {
        return None;
    }
    let destination = navigation_destination(event.event);
    let lowered = destination.to_ascii_lowercase();
    FLOW_ROUTE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
        .then_some(destination)
}

fn friction_type(event: &ClassifiedEvent<'_>, slow_ms: f64) -> Option<&'static str> {
    if event.is_system_feedback() && event.is_rejection() {
        return Some("rejection");
    }
    if event.category == EventCategory::Performance
        && event
            .event
            .metadata_f64("duration")
            .is_some_and(|duration| duration > slow_ms)
    {
        return Some("slow_performance");
    }
    None
}

fn is_completion(event: &ClassifiedEvent<'_>) -> bool {
    if event.is_navigation() {
        return is_completion_route(navigation_destination(event.event));
    }
    event.is_success_response() && is_completion_route(event.route())
}

impl Detector for AbandonmentDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Abandonment
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
        let events = ctx.events;
        if has_intentional_exit(events) {
            return Vec::new();
        }
        let settings = &ctx.config.abandonment;
        let window = secs(settings.friction_window_secs);
        let mut reported: HashSet<&str> = HashSet::new();
        let mut signals = Vec::new();

        for (position, start) in events.iter().enumerate() {
            let Some(route) = flow_route(start) else {
                continue;
            };
            if reported.contains(route) {
                continue;
            }
            let later = &events[position + 1..];
            let friction = later
                .iter()
                .take_while(|event| event.timestamp <= start.timestamp + window)
                .find_map(|event| friction_type(event, settings.slow_performance_ms));
            let Some(friction) = friction else {
                continue;
            };
            if later.iter().any(is_completion) {
                continue;
            }

            reported.insert(route);
            signals.push(CandidateSignal {
                signal_type: SignalType::Abandonment,
                timestamp: start.timestamp,
                route: route.to_string(),
                details: SignalDetails::Abandonment {
                    flow_start: start.event.event_type.clone(),
                    friction_type: friction.to_string(),
                },
            });
        }
        signals
    }
}
