//! Form loops: the same form submitted over and over without a success in between.

use serde::Serialize;
use std::collections::HashMap;

use super::{
    find_click_run, has_success_feedback, CandidateSignal, DetectionContext, Detector,
    SignalDetails, SignalType,
};
use crate::classify::ClassifiedEvent;
use crate::config::ClickRunThresholds;

const SUCCESS_DESTINATION_MARKERS: [&str; 4] = ["success", "confirm", "thank", "complete"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Rapid,
    Sustained,
}

pub struct FormLoopDetector;

fn form_id(event: &ClassifiedEvent<'_>) -> String {
    event
        .event
        .target
        .id_or_selector()
        .unwrap_or("unknown_form")
        .to_string()
}

fn is_submission_success(event: &ClassifiedEvent<'_>) -> bool {
    if event.is_success_response() {
        return true;
    }
    event.is_navigation()
        && event.event.metadata_str("to").is_some_and(|to| {
            let to = to.to_ascii_lowercase();
            SUCCESS_DESTINATION_MARKERS
                .iter()
                .any(|marker| to.contains(marker))
        })
}

impl Detector for FormLoopDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::FormLoop
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
        let settings = &ctx.config.form_loop;
        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), Vec<ClassifiedEvent<'_>>> = HashMap::new();
        for event in ctx.events.iter().filter(|event| event.is_type("form_submit")) {
            let key = (event.route().to_string(), form_id(event));
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(*event);
        }

        let mut signals = Vec::new();
        for key in order {
            let Some(submissions) = groups.get(&key) else {
                continue;
            };
            let (route, form) = key;
            let route_config = ctx.route_config(&route);
            let rapid = ClickRunThresholds::new(
                route_config
                    .form_loop_min_submissions
                    .unwrap_or(settings.rapid_min_submissions),
                settings.rapid_window_secs.saturating_mul(1_000),
                settings.rapid_max_gap_secs.saturating_mul(1_000),
            );
            let sustained = ClickRunThresholds::new(
                route_config
                    .form_loop_min_submissions
                    .unwrap_or(settings.sustained_min_submissions),
                route_config
                    .form_loop_window_secs
                    .unwrap_or(settings.sustained_window_secs)
                    .saturating_mul(1_000),
                settings.sustained_max_gap_secs.saturating_mul(1_000),
            );

            let (run, kind) = if let Some(run) = find_click_run(submissions, &rapid, |_| true) {
                (run, LoopKind::Rapid)
            } else if let Some(run) = find_click_run(submissions, &sustained, |run| {
                let (start, end) = (run[0].timestamp, run[run.len() - 1].timestamp);
                !ctx.events
                    .iter()
                    .filter(|event| event.timestamp > start && event.timestamp < end)
                    .any(is_submission_success)
                    && !has_success_feedback(ctx.events, start, end, &route)
            }) {
                (run, LoopKind::Sustained)
            } else {
                continue;
            };

            let count = run.len() as f64 / 10.0;
            let signal_strength = match kind {
                LoopKind::Rapid => (count * 1.5).min(1.0),
                LoopKind::Sustained => count.min(1.0),
            };
            signals.push(CandidateSignal {
                signal_type: SignalType::FormLoop,
                timestamp: run[0].timestamp,
                route: route.clone(),
                details: SignalDetails::FormLoop {
                    form_id: form,
                    submission_count: run.len(),
                    loop_type: kind,
                    signal_strength,
                },
            });
        }
        signals
    }
}
