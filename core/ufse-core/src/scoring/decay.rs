use chrono::{DateTime, Utc};

use crate::config::DecayConfig;
use crate::correlate::CorrelatedGroup;

/// Strength after `age_secs` of exponential decay, or `None` once the signal
/// is stale (too old, or faded below the floor). Very recent signals get a
/// small boost, capped at 1.
pub fn effective_strength(strength: f64, age_secs: f64, config: &DecayConfig) -> Option<f64> {
    if !config.enabled {
        return Some(strength);
    }
    let age_secs = age_secs.max(0.0);
    if age_secs > config.max_age_secs {
        return None;
    }
    let decayed = strength * 0.5_f64.powf(age_secs / config.half_life_secs);
    if decayed < config.min_strength {
        return None;
    }
    if age_secs < config.recent_window_secs {
        return Some((decayed * config.recent_boost).min(1.0));
    }
    Some(decayed)
}

/// Per-signal effective strengths, aged against the group's latest signal.
pub fn effective_strengths(group: &CorrelatedGroup, config: &DecayConfig) -> Vec<Option<f64>> {
    let reference: DateTime<Utc> = group.window_end;
    group
        .signals
        .iter()
        .map(|signal| {
            let age = (reference - signal.timestamp()).num_milliseconds() as f64 / 1_000.0;
            effective_strength(signal.strength, age, config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_every_half_life() {
        let config = DecayConfig::default();
        let strength = effective_strength(0.8, 60.0, &config).expect("fresh enough");
        assert!((strength - 0.4).abs() < 1e-9);
    }

    #[test]
    fn recent_signals_are_boosted_and_capped() {
        let config = DecayConfig::default();
        let boosted = effective_strength(0.5, 0.0, &config).expect("fresh");
        assert!((boosted - 0.6).abs() < 1e-9);
        assert_eq!(effective_strength(0.95, 0.0, &config), Some(1.0));
    }

    #[test]
    fn stale_signals_are_dropped() {
        let config = DecayConfig::default();
        assert_eq!(effective_strength(1.0, 301.0, &config), None);
        // 0.3 · 0.5^(120/60) = 0.075
        assert_eq!(effective_strength(0.3, 120.0, &config), None);
    }

    #[test]
    fn disabled_decay_is_identity() {
        let config = DecayConfig {
            enabled: false,
            ..DecayConfig::default()
        };
        assert_eq!(effective_strength(0.3, 1_000.0, &config), Some(0.3));
    }
}
