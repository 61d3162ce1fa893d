//! Detection configuration.
//!
//! Loaded once from TOML and then treated as an immutable snapshot: the
//! pipeline and session manager take it at construction and never observe
//! later edits. Every field has a default, so an empty or missing file yields
//! the stock thresholds.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tracing::debug;
use ufse_protocol::ConfidenceLevel;

use crate::error::{Result, UfseError};
use crate::routes::RouteConfig;

/// Longest window, timeout or age any setting may ask for (30 days).
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_WINDOW_MS: u64 = MAX_WINDOW_SECS * 1_000;

/// Seconds as a chrono duration, clamped to [`MAX_WINDOW_SECS`].
pub(crate) fn bounded_secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_WINDOW_SECS) as i64)
}

pub(crate) fn bounded_millis(value: u64) -> Duration {
    Duration::milliseconds(value.min(MAX_WINDOW_MS) as i64)
}

fn bounded_signed_secs(value: i64) -> Duration {
    bounded_secs(value.max(0) as u64)
}

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".ufse/config.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Detect and record, never emit.
    Shadow,
    #[default]
    Primary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,
    #[serde(default = "default_true")]
    pub emit_medium_confidence: bool,
    #[serde(default = "default_shadow_capacity")]
    pub shadow_store_capacity: usize,
    #[serde(default = "default_audit_capacity")]
    pub audit_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Primary,
            emit_medium_confidence: true,
            shadow_store_capacity: default_shadow_capacity(),
            audit_log_capacity: default_audit_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_shadow_capacity() -> usize {
    1000
}

fn default_audit_capacity() -> usize {
    1000
}

/// Global detection sensitivity. Shifts the click counts of every rage tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierLevel {
    High,
    Medium,
    Low,
}

impl TierLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TierLevel::High => "high",
            TierLevel::Medium => "medium",
            TierLevel::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClickRunThresholds {
    pub min_clicks: usize,
    pub time_window_ms: u64,
    pub max_gap_ms: u64,
}

impl ClickRunThresholds {
    pub const fn new(min_clicks: usize, time_window_ms: u64, max_gap_ms: u64) -> Self {
        Self {
            min_clicks,
            time_window_ms,
            max_gap_ms,
        }
    }

    pub fn time_window(&self) -> Duration {
        bounded_millis(self.time_window_ms)
    }

    pub fn max_gap(&self) -> Duration {
        bounded_millis(self.max_gap_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RageTier {
    pub level: TierLevel,
    pub thresholds: ClickRunThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RageConfig {
    pub high: ClickRunThresholds,
    pub medium: ClickRunThresholds,
    pub low: ClickRunThresholds,
}

impl Default for RageConfig {
    fn default() -> Self {
        Self {
            high: ClickRunThresholds::new(5, 2_000, 300),
            medium: ClickRunThresholds::new(4, 3_000, 500),
            low: ClickRunThresholds::new(3, 5_000, 800),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RageBaitConfig {
    pub enabled: bool,
    pub min_clicks: usize,
    pub time_window_ms: u64,
    pub max_gap_ms: u64,
    pub min_dark_pattern_score: f64,
    pub min_indicators: usize,
}

impl Default for RageBaitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_clicks: 3,
            time_window_ms: 5_000,
            max_gap_ms: 1_000,
            min_dark_pattern_score: 0.6,
            min_indicators: 2,
        }
    }
}

impl RageBaitConfig {
    pub fn thresholds(&self) -> ClickRunThresholds {
        ClickRunThresholds::new(self.min_clicks, self.time_window_ms, self.max_gap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlockedConfig {
    pub rejection_window_secs: u64,
    pub retry_window_secs: u64,
    pub max_retry_gap_secs: u64,
    /// Retries that must themselves be rejected. The first failure never counts.
    pub min_failed_retries: usize,
}

impl Default for BlockedConfig {
    fn default() -> Self {
        Self {
            rejection_window_secs: 30,
            retry_window_secs: 30,
            max_retry_gap_secs: 5,
            min_failed_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AbandonmentConfig {
    pub friction_window_secs: u64,
    pub slow_performance_ms: f64,
}

impl Default for AbandonmentConfig {
    fn default() -> Self {
        Self {
            friction_window_secs: 60,
            slow_performance_ms: 3_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfusionConfig {
    pub oscillation_threshold: usize,
    pub oscillation_window_secs: u64,
    pub scroll_threshold: usize,
    pub scroll_window_secs: u64,
}

impl Default for ConfusionConfig {
    fn default() -> Self {
        Self {
            oscillation_threshold: 4,
            oscillation_window_secs: 60,
            scroll_threshold: 15,
            scroll_window_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormLoopConfig {
    pub rapid_min_submissions: usize,
    pub rapid_window_secs: u64,
    pub rapid_max_gap_secs: u64,
    pub sustained_min_submissions: usize,
    pub sustained_window_secs: u64,
    pub sustained_max_gap_secs: u64,
}

impl Default for FormLoopConfig {
    fn default() -> Self {
        Self {
            rapid_min_submissions: 4,
            rapid_window_secs: 10,
            rapid_max_gap_secs: 2,
            sustained_min_submissions: 3,
            sustained_window_secs: 30,
            sustained_max_gap_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualificationConfig {
    pub proximity_window_secs: u64,
    pub cause_window_secs: u64,
    pub feedback_window_secs: u64,
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            proximity_window_secs: 30,
            cause_window_secs: 10,
            feedback_window_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrelationConfig {
    pub time_window_secs: u64,
    pub single_signal_strength_threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            time_window_secs: 30,
            single_signal_strength_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecayConfig {
    pub enabled: bool,
    pub half_life_secs: f64,
    pub max_age_secs: f64,
    pub min_strength: f64,
    pub recent_window_secs: f64,
    pub recent_boost: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            half_life_secs: 60.0,
            max_age_secs: 300.0,
            min_strength: 0.1,
            recent_window_secs: 10.0,
            recent_boost: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalWeights {
    pub rage: f64,
    pub rage_bait: f64,
    pub blocked: f64,
    pub abandonment: f64,
    pub confusion: f64,
    pub form_loop: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            rage: 0.3,
            rage_bait: 0.5,
            blocked: 0.4,
            abandonment: 0.3,
            confusion: 0.1,
            form_loop: 0.35,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionLimits {
    pub idle_timeout_secs: i64,
    pub completion_timeout_secs: i64,
    pub max_duration_secs: i64,
    pub max_duration_hard_secs: i64,
    pub max_events: usize,
    pub clock_skew_tolerance_secs: i64,
    pub max_past_timestamp_secs: i64,
    pub completed_retention_secs: i64,
    pub state_sweep_secs: u64,
    pub cleanup_sweep_secs: u64,
    pub emission_sweep_secs: u64,
    pub handoff_capacity: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 5 * 60,
            completion_timeout_secs: 10 * 60,
            max_duration_secs: 4 * 60 * 60,
            max_duration_hard_secs: 24 * 60 * 60,
            max_events: 10_000,
            clock_skew_tolerance_secs: 5 * 60,
            max_past_timestamp_secs: 30 * 24 * 60 * 60,
            completed_retention_secs: 24 * 60 * 60,
            state_sweep_secs: 30,
            cleanup_sweep_secs: 60 * 60,
            emission_sweep_secs: 10,
            handoff_capacity: 1000,
        }
    }
}

impl SessionLimits {
    pub fn idle_timeout(&self) -> Duration {
        bounded_signed_secs(self.idle_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        bounded_signed_secs(self.completion_timeout_secs)
    }

    pub fn max_duration(&self) -> Duration {
        bounded_signed_secs(self.max_duration_secs)
    }

    pub fn max_duration_hard(&self) -> Duration {
        bounded_signed_secs(self.max_duration_hard_secs)
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        bounded_signed_secs(self.clock_skew_tolerance_secs)
    }

    pub fn max_past_timestamp(&self) -> Duration {
        bounded_signed_secs(self.max_past_timestamp_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        bounded_signed_secs(self.completed_retention_secs)
    }

    pub fn state_sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.state_sweep_secs)
    }

    pub fn cleanup_sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.cleanup_sweep_secs)
    }

    pub fn emission_sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.emission_sweep_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwardingConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
    pub deadline_ms: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2,
            deadline_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default = "default_true")]
    pub use_predefined_routes: bool,
    #[serde(default)]
    pub rage: RageConfig,
    #[serde(default)]
    pub rage_bait: RageBaitConfig,
    #[serde(default)]
    pub blocked: BlockedConfig,
    #[serde(default)]
    pub abandonment: AbandonmentConfig,
    #[serde(default)]
    pub confusion: ConfusionConfig,
    #[serde(default)]
    pub form_loop: FormLoopConfig,
    #[serde(default)]
    pub qualification: QualificationConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub weights: SignalWeights,
    #[serde(default)]
    pub session: SessionLimits,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            sensitivity: Sensitivity::Medium,
            use_predefined_routes: true,
            rage: RageConfig::default(),
            rage_bait: RageBaitConfig::default(),
            blocked: BlockedConfig::default(),
            abandonment: AbandonmentConfig::default(),
            confusion: ConfusionConfig::default(),
            form_loop: FormLoopConfig::default(),
            qualification: QualificationConfig::default(),
            correlation: CorrelationConfig::default(),
            decay: DecayConfig::default(),
            weights: SignalWeights::default(),
            session: SessionLimits::default(),
            forwarding: ForwardingConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl DetectionConfig {
    /// Rage tiers in evaluation order (high first), with sensitivity applied.
    pub fn rage_tiers(&self) -> [RageTier; 3] {
        let shift = |thresholds: ClickRunThresholds| {
            let min_clicks = match self.sensitivity {
                Sensitivity::Low => thresholds.min_clicks + 1,
                Sensitivity::Medium => thresholds.min_clicks,
                Sensitivity::High => thresholds.min_clicks.saturating_sub(1).max(2),
            };
            ClickRunThresholds {
                min_clicks,
                ..thresholds
            }
        };
        [
            RageTier {
                level: TierLevel::High,
                thresholds: shift(self.rage.high),
            },
            RageTier {
                level: TierLevel::Medium,
                thresholds: shift(self.rage.medium),
            },
            RageTier {
                level: TierLevel::Low,
                thresholds: shift(self.rage.low),
            },
        ]
    }

    /// Lowest confidence that may be emitted absent a route override.
    pub fn min_emit_confidence(&self) -> ConfidenceLevel {
        if self.engine.emit_medium_confidence {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }

    pub fn validate(&self) -> Result<()> {
        let unit_values = [
            ("weights.rage", self.weights.rage),
            ("weights.rage_bait", self.weights.rage_bait),
            ("weights.blocked", self.weights.blocked),
            ("weights.abandonment", self.weights.abandonment),
            ("weights.confusion", self.weights.confusion),
            ("weights.form_loop", self.weights.form_loop),
            (
                "correlation.single_signal_strength_threshold",
                self.correlation.single_signal_strength_threshold,
            ),
            (
                "rage_bait.min_dark_pattern_score",
                self.rage_bait.min_dark_pattern_score,
            ),
            ("decay.min_strength", self.decay.min_strength),
        ];
        for (field, value) in unit_values {
            if !(0.0..=1.0).contains(&value) {
                return Err(UfseError::invalid_config(field, "must be within [0, 1]"));
            }
        }

        for (name, thresholds) in [
            ("rage.high", self.rage.high),
            ("rage.medium", self.rage.medium),
            ("rage.low", self.rage.low),
            ("rage_bait", self.rage_bait.thresholds()),
        ] {
            if thresholds.min_clicks < 2 {
                return Err(UfseError::invalid_config(name, "min_clicks must be at least 2"));
            }
            if thresholds.time_window_ms == 0 || thresholds.max_gap_ms == 0 {
                return Err(UfseError::invalid_config(name, "windows must be positive"));
            }
            if thresholds.time_window_ms > MAX_WINDOW_MS || thresholds.max_gap_ms > MAX_WINDOW_MS {
                return Err(UfseError::invalid_config(name, "windows must not exceed 30 days"));
            }
        }

        let windows_secs = [
            ("blocked.rejection_window_secs", self.blocked.rejection_window_secs),
            ("blocked.retry_window_secs", self.blocked.retry_window_secs),
            ("blocked.max_retry_gap_secs", self.blocked.max_retry_gap_secs),
            ("abandonment.friction_window_secs", self.abandonment.friction_window_secs),
            ("confusion.oscillation_window_secs", self.confusion.oscillation_window_secs),
            ("confusion.scroll_window_secs", self.confusion.scroll_window_secs),
            ("form_loop.rapid_window_secs", self.form_loop.rapid_window_secs),
            ("form_loop.rapid_max_gap_secs", self.form_loop.rapid_max_gap_secs),
            ("form_loop.sustained_window_secs", self.form_loop.sustained_window_secs),
            ("form_loop.sustained_max_gap_secs", self.form_loop.sustained_max_gap_secs),
            ("qualification.proximity_window_secs", self.qualification.proximity_window_secs),
            ("qualification.cause_window_secs", self.qualification.cause_window_secs),
            ("qualification.feedback_window_secs", self.qualification.feedback_window_secs),
            ("correlation.time_window_secs", self.correlation.time_window_secs),
        ];
        for (field, value) in windows_secs {
            if value > MAX_WINDOW_SECS {
                return Err(UfseError::invalid_config(field, "must not exceed 30 days"));
            }
        }

        let session_secs = [
            ("session.idle_timeout_secs", self.session.idle_timeout_secs),
            ("session.completion_timeout_secs", self.session.completion_timeout_secs),
            ("session.max_duration_secs", self.session.max_duration_secs),
            ("session.max_duration_hard_secs", self.session.max_duration_hard_secs),
            ("session.clock_skew_tolerance_secs", self.session.clock_skew_tolerance_secs),
            ("session.max_past_timestamp_secs", self.session.max_past_timestamp_secs),
            ("session.completed_retention_secs", self.session.completed_retention_secs),
        ];
        for (field, value) in session_secs {
            if !(0..=MAX_WINDOW_SECS as i64).contains(&value) {
                return Err(UfseError::invalid_config(field, "must be within 0 and 30 days"));
            }
        }

        for route in &self.routes {
            let oversized = route.rage_time_window_ms.is_some_and(|ms| ms > MAX_WINDOW_MS)
                || route.rage_max_gap_ms.is_some_and(|ms| ms > MAX_WINDOW_MS)
                || route.form_loop_window_secs.is_some_and(|secs| secs > MAX_WINDOW_SECS);
            if oversized {
                return Err(UfseError::invalid_config(
                    &format!("routes[{}]", route.pattern),
                    "windows must not exceed 30 days",
                ));
            }
        }

        if self.decay.enabled && self.decay.half_life_secs <= 0.0 {
            return Err(UfseError::invalid_config(
                "decay.half_life_secs",
                "must be positive",
            ));
        }
        if self.correlation.time_window_secs == 0 {
            return Err(UfseError::invalid_config(
                "correlation.time_window_secs",
                "must be positive",
            ));
        }
        if self.confusion.oscillation_threshold == 0 || self.confusion.scroll_threshold == 0 {
            return Err(UfseError::invalid_config(
                "confusion",
                "thresholds must be positive",
            ));
        }
        if self.session.handoff_capacity == 0 {
            return Err(UfseError::invalid_config(
                "session.handoff_capacity",
                "must be positive",
            ));
        }
        if self.forwarding.max_attempts == 0 {
            return Err(UfseError::invalid_config(
                "forwarding.max_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(UfseError::HomeDirNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads and validates the config. A missing file yields defaults.
pub fn load_detection_config(path: Option<PathBuf>) -> Result<DetectionConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        debug!(path = %config_path.display(), "No detection config found; using defaults");
        return Ok(DetectionConfig::default());
    }

    let content =
        fs_err::read_to_string(&config_path).map_err(|source| UfseError::ConfigRead {
            path: config_path.clone(),
            source,
        })?;
    let config: DetectionConfig =
        toml::from_str(&content).map_err(|err| UfseError::ConfigMalformed {
            path: config_path.clone(),
            details: err.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}
