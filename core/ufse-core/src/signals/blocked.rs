//! Blocked progress: the user keeps retrying an action the system keeps rejecting.
//!
//! A single rejected attempt is normal; only a retry that is rejected again
//! counts as being blocked.

use chrono::{DateTime, Utc};

use super::{secs, CandidateSignal, DetectionContext, Detector, SignalDetails, SignalType};
use crate::classify::ClassifiedEvent;

pub struct BlockedDetector;

fn is_action(event: &ClassifiedEvent<'_>) -> bool {
    if event.is_type("form_submit") {
        return true;
    }
    event.is_click()
        && event
            .event
            .target
            .id_or_selector()
            .map(|label| label.to_ascii_lowercase().contains("submit"))
            .unwrap_or(false)
}

fn is_same_action(candidate: &ClassifiedEvent<'_>, action: &ClassifiedEvent<'_>) -> bool {
    candidate.event.event_type == action.event.event_type
        && candidate.event.target.identity() == action.event.target.identity()
}

fn rejection_type(event: &ClassifiedEvent<'_>) -> &'static str {
    if event.is_type("network_error") {
        "network_error"
    } else if matches!(event.event.http_status(), Some(status) if status >= 400) {
        "http_error"
    } else {
        "javascript_error"
    }
}

impl Detector for BlockedDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Blocked
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
        let settings = &ctx.config.blocked;
        let events = ctx.events;
        let mut signals = Vec::new();
        let mut consumed_until: Option<DateTime<Utc>> = None;

        for (position, action) in events.iter().enumerate() {
            if !is_action(action) {
                continue;
            }
            if consumed_until.is_some_and(|until| action.timestamp <= until) {
                continue;
            }

            let rejection_deadline = action.timestamp + secs(settings.rejection_window_secs);
            let Some((rejection_at, rejection)) = events
                .iter()
                .enumerate()
                .skip(position + 1)
                .take_while(|(_, event)| event.timestamp <= rejection_deadline)
                .find(|(_, event)| event.is_rejection())
            else {
                continue;
            };

            let retry_deadline = rejection.timestamp + secs(settings.retry_window_secs);
            let max_gap = secs(settings.max_retry_gap_secs);
            let mut retries: Vec<usize> = Vec::new();
            let mut last_seen = rejection.timestamp;
            for (index, candidate) in events.iter().enumerate().skip(rejection_at + 1) {
                if candidate.timestamp > retry_deadline {
                    break;
                }
                if !is_same_action(candidate, action) {
                    continue;
                }
                if candidate.timestamp - last_seen > max_gap {
                    break;
                }
                retries.push(index);
                last_seen = candidate.timestamp;
            }
            if retries.is_empty() {
                continue;
            }

            let failed_retries = retries
                .iter()
                .enumerate()
                .filter(|(n, index)| {
                    let index = **index;
                    let next_retry = retries.get(n + 1).copied().unwrap_or(events.len());
                    let deadline = events[index].timestamp + secs(settings.rejection_window_secs);
                    events[index + 1..next_retry]
                        .iter()
                        .take_while(|event| event.timestamp <= deadline)
                        .any(|event| event.is_rejection())
                })
                .count();
            if failed_retries < settings.min_failed_retries {
                continue;
            }

            consumed_until = Some(last_seen);
            signals.push(CandidateSignal {
                signal_type: SignalType::Blocked,
                timestamp: action.timestamp,
                route: action.route().to_string(),
                details: SignalDetails::Blocked {
                    target_id: action.event.target.identity().to_string(),
                    action_type: action.event.event_type.clone(),
                    rejection_type: rejection_type(rejection).to_string(),
                    retry_count: retries.len(),
                },
            });
        }
        signals
    }
}
