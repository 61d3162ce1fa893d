//! Per-route overrides of the global detection thresholds.
//!
//! Patterns are globs: `**` spans path segments, `*` stays within one segment,
//! `?` matches a single character. The first matching override in priority
//! order wins; overrides never stack.

use regex::Regex;
use serde::{Deserialize, Serialize};
use ufse_protocol::ConfidenceLevel;

use crate::config::{DetectionConfig, RageTier};
use crate::error::{Result, UfseError};
use crate::signals::SignalType;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    pub pattern: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rage_min_clicks: Option<usize>,
    #[serde(default)]
    pub rage_time_window_ms: Option<u64>,
    #[serde(default)]
    pub rage_max_gap_ms: Option<u64>,
    #[serde(default)]
    pub form_loop_min_submissions: Option<usize>,
    #[serde(default)]
    pub form_loop_window_secs: Option<u64>,
    #[serde(default)]
    pub min_confidence: Option<ConfidenceLevel>,
    #[serde(default)]
    pub disable_rage: bool,
    #[serde(default)]
    pub disable_blocked: bool,
    #[serde(default)]
    pub disable_abandonment: bool,
    #[serde(default)]
    pub disable_confusion: bool,
    #[serde(default)]
    pub disable_form_loop: bool,
    #[serde(default)]
    pub shadow: bool,
}

impl RouteConfig {
    pub fn new(pattern: impl Into<String>, priority: i32) -> Self {
        Self {
            pattern: pattern.into(),
            priority,
            ..Self::default()
        }
    }
}

/// Overrides shipped with the engine.
pub fn predefined_route_configs() -> Vec<RouteConfig> {
    let payment = |pattern: &str| RouteConfig {
        rage_min_clicks: Some(3),
        rage_time_window_ms: Some(5_000),
        min_confidence: Some(ConfidenceLevel::Medium),
        ..RouteConfig::new(pattern, 100)
    };
    vec![
        payment("/checkout/**"),
        payment("/payment/**"),
        RouteConfig {
            rage_min_clicks: Some(10),
            disable_rage: true,
            ..RouteConfig::new("/game/**", 90)
        },
        RouteConfig {
            disable_rage: true,
            disable_confusion: true,
            disable_abandonment: true,
            ..RouteConfig::new("/api/**", 80)
        },
        RouteConfig {
            shadow: true,
            ..RouteConfig::new("/admin/**", 70)
        },
    ]
}

/// Converts a route glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{}$", escaped)).map_err(|err| UfseError::InvalidRoutePattern {
        pattern: pattern.to_string(),
        details: err.to_string(),
    })
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    config: RouteConfig,
    matcher: Regex,
}

/// Ordered set of route overrides, highest priority first.
#[derive(Debug, Clone, Default)]
pub struct RouteConfigManager {
    routes: Vec<CompiledRoute>,
}

impl RouteConfigManager {
    pub fn new(configs: Vec<RouteConfig>) -> Result<Self> {
        let mut manager = Self::default();
        for config in configs {
            manager.add(config)?;
        }
        Ok(manager)
    }

    /// Builds the manager from the config's `[[routes]]`, plus the predefined
    /// set when enabled. User routes are inserted first so they win ties.
    pub fn from_config(config: &DetectionConfig) -> Result<Self> {
        let mut configs = config.routes.clone();
        if config.use_predefined_routes {
            configs.extend(predefined_route_configs());
        }
        Self::new(configs)
    }

    pub fn add(&mut self, config: RouteConfig) -> Result<()> {
        let matcher = glob_to_regex(&config.pattern)?;
        let position = self
            .routes
            .iter()
            .position(|existing| existing.config.priority < config.priority)
            .unwrap_or(self.routes.len());
        self.routes
            .insert(position, CompiledRoute { config, matcher });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn find(&self, route: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .find(|compiled| compiled.matcher.is_match(route))
            .map(|compiled| &compiled.config)
    }

    /// Effective settings for `route`: the global snapshot with the winning
    /// override applied.
    pub fn resolve(&self, route: &str, base: &DetectionConfig) -> MergedRouteConfig {
        let mut merged = MergedRouteConfig::from_base(base);
        let Some(route_config) = self.find(route) else {
            return merged;
        };

        merged.matched_pattern = Some(route_config.pattern.clone());
        for tier in merged.rage_tiers.iter_mut() {
            if let Some(min_clicks) = route_config.rage_min_clicks {
                tier.thresholds.min_clicks = min_clicks;
            }
            if let Some(window) = route_config.rage_time_window_ms {
                tier.thresholds.time_window_ms = window;
            }
            if let Some(gap) = route_config.rage_max_gap_ms {
                tier.thresholds.max_gap_ms = gap;
            }
        }
        if let Some(min_submissions) = route_config.form_loop_min_submissions {
            merged.form_loop_min_submissions = Some(min_submissions);
        }
        if let Some(window) = route_config.form_loop_window_secs {
            merged.form_loop_window_secs = Some(window);
        }
        if let Some(level) = route_config.min_confidence {
            merged.min_confidence = level.max(ConfidenceLevel::Medium);
        }
        merged.disable_rage = route_config.disable_rage;
        merged.disable_blocked = route_config.disable_blocked;
        merged.disable_abandonment = route_config.disable_abandonment;
        merged.disable_confusion = route_config.disable_confusion;
        merged.disable_form_loop = route_config.disable_form_loop;
        merged.shadow = route_config.shadow;
        merged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRouteConfig {
    pub matched_pattern: Option<String>,
    pub rage_tiers: [RageTier; 3],
    pub form_loop_min_submissions: Option<usize>,
    pub form_loop_window_secs: Option<u64>,
    pub min_confidence: ConfidenceLevel,
    pub disable_rage: bool,
    pub disable_blocked: bool,
    pub disable_abandonment: bool,
    pub disable_confusion: bool,
    pub disable_form_loop: bool,
    pub shadow: bool,
}

impl MergedRouteConfig {
    fn from_base(base: &DetectionConfig) -> Self {
        Self {
            matched_pattern: None,
            rage_tiers: base.rage_tiers(),
            form_loop_min_submissions: None,
            form_loop_window_secs: None,
            min_confidence: base.min_emit_confidence(),
            disable_rage: false,
            disable_blocked: false,
            disable_abandonment: false,
            disable_confusion: false,
            disable_form_loop: false,
            shadow: false,
        }
    }

    /// Rage bait shares the rage switch.
    pub fn is_disabled(&self, signal_type: SignalType) -> bool {
        match signal_type {
            SignalType::Rage | SignalType::RageBait => self.disable_rage,
            SignalType::Blocked => self.disable_blocked,
            SignalType::Abandonment => self.disable_abandonment,
            SignalType::Confusion => self.disable_confusion,
            SignalType::FormLoop => self.disable_form_loop,
        }
    }
}
