//! Tiered rage-click detection.
//!
//! One detector, three threshold tiers tried strictest first. The first tier
//! that finds a qualifying run on a target wins and the target is done.

use super::{
    clicks_by_target, find_click_run, has_success_feedback, span_ms, CandidateSignal,
    DetectionContext, Detector, SignalDetails, SignalType,
};
use crate::classify::ClassifiedEvent;
use crate::config::ClickRunThresholds;

pub struct RageDetector;

impl Detector for RageDetector {
    fn signal_type(&self) -> SignalType {
        SignalType::Rage
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<CandidateSignal> {
        let mut signals = Vec::new();
        for (target_id, clicks) in clicks_by_target(ctx.events) {
            let Some(first) = clicks.first() else {
                continue;
            };
            let route = first.route();
            let route_config = ctx.route_config(route);

            for tier in route_config.rage_tiers.iter() {
                let run = find_click_run(&clicks, &tier.thresholds, |run| {
                    let (start, end) = (run[0].timestamp, run[run.len() - 1].timestamp);
                    !has_success_feedback(ctx.events, start, end, route)
                });
                let Some(run) = run else {
                    continue;
                };
                let strength_score = rage_strength(run, &tier.thresholds);
                signals.push(CandidateSignal {
                    signal_type: SignalType::Rage,
                    timestamp: run[0].timestamp,
                    route: route.to_string(),
                    details: SignalDetails::Rage {
                        target_id: target_id.clone(),
                        interaction_count: run.len(),
                        time_window_ms: span_ms(run),
                        tier: tier.level,
                        strength_score,
                    },
                });
                break;
            }
        }
        signals
    }
}

/// Blend of click density, time compression and rhythm regularity in [0, 1].
pub fn rage_strength(run: &[ClassifiedEvent<'_>], thresholds: &ClickRunThresholds) -> f64 {
    let gaps: Vec<f64> = run
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64)
        .collect();
    let density = (run.len() as f64 / 10.0).min(1.0);
    if gaps.is_empty() {
        return (0.4 * density + 0.6).clamp(0.0, 1.0);
    }

    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let max_gap = thresholds.max_gap_ms.max(1) as f64;
    let compression = (1.0 - mean / max_gap).clamp(0.0, 1.0);
    let consistency = if mean <= 0.0 {
        1.0
    } else {
        let variance = gaps.iter().map(|gap| (gap - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
        (1.0 - (variance.sqrt() / mean) / 2.0).clamp(0.0, 1.0)
    };

    (0.4 * density + 0.4 * compression + 0.2 * consistency).clamp(0.0, 1.0)
}
