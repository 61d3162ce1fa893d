//! The detection pipeline for one completed session:
//! classify → detect → filter → qualify → correlate → score → resolve →
//! explain → emit.
//!
//! Every stage is deterministic and infallible. A session or group that does
//! not make it through ends with a [`DiscardReason`], which is counted, logged
//! and reported, never raised.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, info};
use ufse_protocol::{ConfidenceLevel, Incident, Session};

use crate::audit::{SuppressionAuditLog, SuppressionRecord};
use crate::classify::{classify_session, ClassifiedEvent};
use crate::config::{DetectionConfig, EngineMode};
use crate::correlate::{correlate, CorrelatedGroup};
use crate::discard::DiscardReason;
use crate::emit::{assemble_incident, IncidentParts};
use crate::error::Result;
use crate::explain::explain;
use crate::failure_point::resolve_failure_point;
use crate::false_alarm::filter_candidates;
use crate::observability::{
    Observer, DARK_PATTERN_SCORE, INCIDENTS_EMITTED, MEDIUM_CONFIDENCE_INCIDENTS,
    PROCESSING_DURATION_SECONDS, RAGE_BAIT_DETECTIONS, SESSIONS_PROCESSED, SHADOW_DETECTIONS,
    SIGNALS_DETECTED, SIGNALS_DISCARDED, SIGNAL_STRENGTH, SINGLE_SIGNAL_INCIDENTS,
};
use crate::qualify::{qualify, QualifiedSignal};
use crate::routes::RouteConfigManager;
use crate::scoring::{classify_severity, evaluate_confidence, frustration_score};
use crate::shadow::ShadowModeManager;
use crate::signals::{
    default_detectors, detect_candidates, CandidateSignal, DetectionContext, Detector,
    SignalDetails,
};

const ROUTE_DISABLED: &str = "route_disabled";
const SHADOW_MODE: &str = "shadow_mode";

/// What one pipeline run produced.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub session_id: String,
    pub emitted: Vec<Incident>,
    pub shadowed: Vec<Incident>,
    pub discards: Vec<DiscardReason>,
    pub candidate_count: usize,
    pub disabled_count: usize,
    pub vetoed_count: usize,
    pub qualified_count: usize,
    pub group_count: usize,
    pub duration: StdDuration,
}

impl PipelineReport {
    pub fn discarded(&self, reason: DiscardReason) -> bool {
        self.discards.contains(&reason)
    }
}

enum GroupOutcome {
    Emitted(Incident),
    Shadowed(Incident),
}

pub struct Pipeline {
    config: DetectionConfig,
    routes: RouteConfigManager,
    detectors: Vec<Box<dyn Detector>>,
    shadow: Arc<ShadowModeManager>,
    audit: Arc<SuppressionAuditLog>,
    observer: Arc<dyn Observer>,
}

impl Pipeline {
    /// Builds a pipeline with its own shadow recorder and audit log, sized
    /// from the engine settings.
    pub fn new(config: DetectionConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        config.validate()?;
        let routes = RouteConfigManager::from_config(&config)?;
        let shadow = Arc::new(ShadowModeManager::new(config.engine.shadow_store_capacity));
        let audit = Arc::new(SuppressionAuditLog::new(config.engine.audit_log_capacity));
        Ok(Self::with_parts(config, routes, shadow, audit, observer))
    }

    pub fn with_parts(
        config: DetectionConfig,
        routes: RouteConfigManager,
        shadow: Arc<ShadowModeManager>,
        audit: Arc<SuppressionAuditLog>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            config,
            routes,
            detectors: default_detectors(),
            shadow,
            audit,
            observer,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn shadow(&self) -> &Arc<ShadowModeManager> {
        &self.shadow
    }

    pub fn audit(&self) -> &Arc<SuppressionAuditLog> {
        &self.audit
    }

    pub fn process(&self, session: &Session) -> PipelineReport {
        let started = Instant::now();
        self.observer.increment(SESSIONS_PROCESSED, None, 1);
        let mut report = PipelineReport {
            session_id: session.session_id.clone(),
            ..PipelineReport::default()
        };

        self.run(session, &mut report);

        report.duration = started.elapsed();
        self.observer.observe(
            PROCESSING_DURATION_SECONDS,
            None,
            report.duration.as_secs_f64(),
        );
        debug!(
            session_id = %session.session_id,
            emitted = report.emitted.len(),
            shadowed = report.shadowed.len(),
            discards = report.discards.len(),
            "Session processed"
        );
        report
    }

    fn run(&self, session: &Session, report: &mut PipelineReport) {
        if session.events.is_empty() {
            self.discard_session(session, report, DiscardReason::NoEvents);
            return;
        }

        let events = classify_session(session);
        let ctx = DetectionContext {
            session,
            events: &events,
            config: &self.config,
            routes: &self.routes,
        };
        let candidates = detect_candidates(&self.detectors, &ctx);
        report.candidate_count = candidates.len();
        candidates.iter().for_each(|candidate| self.record_detection(candidate));

        let candidates = self.drop_disabled(session, &ctx, candidates, report);
        let (candidates, vetoed) = filter_candidates(candidates, &events, session);
        report.vetoed_count = vetoed.len();
        for entry in &vetoed {
            self.suppress(session, &entry.candidate, entry.reason.as_str(), String::new());
        }
        if candidates.is_empty() {
            self.discard_session(session, report, DiscardReason::NoCandidates);
            return;
        }

        let qualified = self.qualify_all(session, candidates, &events);
        report.qualified_count = qualified.len();
        if qualified.is_empty() {
            self.discard_session(session, report, DiscardReason::QualificationFailed);
            return;
        }

        let groups = correlate(&qualified, &self.config.correlation);
        report.group_count = groups.len();
        if groups.is_empty() {
            for signal in &qualified {
                self.suppress(
                    session,
                    &signal.candidate,
                    DiscardReason::CorrelationFailed.as_str(),
                    String::new(),
                );
            }
            self.discard_session(session, report, DiscardReason::CorrelationFailed);
            return;
        }

        for group in &groups {
            match self.process_group(session, group) {
                Ok(GroupOutcome::Emitted(incident)) => report.emitted.push(incident),
                Ok(GroupOutcome::Shadowed(incident)) => report.shadowed.push(incident),
                Err(reason) => {
                    for signal in &group.signals {
                        self.suppress(session, &signal.candidate, reason.as_str(), String::new());
                    }
                    debug!(
                        session_id = %session.session_id,
                        route = %group.route,
                        reason = reason.as_str(),
                        "Correlated group discarded"
                    );
                    report.discards.push(reason);
                }
            }
        }
    }

    fn record_detection(&self, candidate: &CandidateSignal) {
        let label = Some(candidate.signal_type.as_str());
        self.observer.increment(SIGNALS_DETECTED, label, 1);
        self.observer
            .observe(SIGNAL_STRENGTH, label, candidate.strength());
        if let SignalDetails::RageBait {
            dark_pattern_score, ..
        } = candidate.details
        {
            self.observer.increment(RAGE_BAIT_DETECTIONS, None, 1);
            self.observer
                .observe(DARK_PATTERN_SCORE, None, dark_pattern_score);
        }
    }

    fn drop_disabled(
        &self,
        session: &Session,
        ctx: &DetectionContext<'_>,
        candidates: Vec<CandidateSignal>,
        report: &mut PipelineReport,
    ) -> Vec<CandidateSignal> {
        let (disabled, enabled): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|candidate| {
            ctx.route_config(&candidate.route)
                .is_disabled(candidate.signal_type)
        });
        report.disabled_count = disabled.len();
        for candidate in &disabled {
            let pattern = self
                .routes
                .find(&candidate.route)
                .map(|route_config| route_config.pattern.clone())
                .unwrap_or_default();
            self.suppress(session, candidate, ROUTE_DISABLED, pattern);
        }
        enabled
    }

    fn qualify_all(
        &self,
        session: &Session,
        candidates: Vec<CandidateSignal>,
        events: &[ClassifiedEvent<'_>],
    ) -> Vec<QualifiedSignal> {
        let mut qualified = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let snapshot = candidate.clone();
            match qualify(candidate, events, &self.config.qualification) {
                Ok(signal) => qualified.push(signal),
                Err(failure) => self.suppress(
                    session,
                    &snapshot,
                    DiscardReason::QualificationFailed.as_str(),
                    failure.as_str().to_string(),
                ),
            }
        }
        qualified
    }

    fn process_group(
        &self,
        session: &Session,
        group: &CorrelatedGroup,
    ) -> std::result::Result<GroupOutcome, DiscardReason> {
        let threshold = self.config.correlation.single_signal_strength_threshold;
        let score = frustration_score(group, &self.config.weights, &self.config.decay);
        let confidence = evaluate_confidence(group, threshold);
        let route_config = self.routes.resolve(&group.route, &self.config);
        let min_confidence = route_config.min_confidence.max(ConfidenceLevel::Medium);
        let shadow = self.config.engine.mode == EngineMode::Shadow || route_config.shadow;

        if !shadow && confidence < min_confidence {
            return Err(DiscardReason::LowConfidence);
        }
        let failure_point =
            resolve_failure_point(group).ok_or(DiscardReason::AmbiguousFailurePoint)?;
        let explanation = explain(
            group,
            confidence,
            &failure_point,
            self.config.correlation.time_window_secs,
        )
        .ok_or(DiscardReason::ExplanationFailed)?;

        let now = Utc::now();
        let incident = assemble_incident(
            IncidentParts {
                session,
                group,
                score,
                confidence,
                severity: classify_severity(group),
                failure_point: &failure_point,
                explanation,
            },
            now,
        );

        if shadow {
            let would_emit = confidence >= min_confidence;
            self.observer
                .increment(SHADOW_DETECTIONS, Some(group.route.as_str()), 1);
            self.audit.record(SuppressionRecord {
                session_id: session.session_id.clone(),
                route: group.route.clone(),
                signal_type: None,
                strength: Some(group.average_strength()),
                reason: SHADOW_MODE.to_string(),
                details: incident.primary_failure_point.clone(),
                recorded_at: now,
            });
            info!(
                session_id = %session.session_id,
                route = %group.route,
                confidence = confidence.as_str(),
                would_emit,
                "Shadow incident recorded"
            );
            self.shadow
                .record(incident.clone(), &group.route, would_emit, now);
            return Ok(GroupOutcome::Shadowed(incident));
        }

        self.observer
            .increment(INCIDENTS_EMITTED, Some(incident.severity_type.as_str()), 1);
        if group.len() == 1 {
            self.observer.increment(SINGLE_SIGNAL_INCIDENTS, None, 1);
        }
        if confidence == ConfidenceLevel::Medium {
            self.observer.increment(MEDIUM_CONFIDENCE_INCIDENTS, None, 1);
        }
        info!(
            session_id = %session.session_id,
            incident_id = %incident.incident_id,
            score = incident.frustration_score,
            confidence = confidence.as_str(),
            severity = incident.severity_type.as_str(),
            failure_point = %incident.primary_failure_point,
            "Incident emitted"
        );
        Ok(GroupOutcome::Emitted(incident))
    }

    fn discard_session(
        &self,
        session: &Session,
        report: &mut PipelineReport,
        reason: DiscardReason,
    ) {
        debug!(
            session_id = %session.session_id,
            reason = reason.as_str(),
            "Session produced no incident"
        );
        report.discards.push(reason);
    }

    fn suppress(
        &self,
        session: &Session,
        candidate: &CandidateSignal,
        reason: &str,
        details: String,
    ) {
        self.observer.increment(SIGNALS_DISCARDED, Some(reason), 1);
        self.audit.record(SuppressionRecord {
            session_id: session.session_id.clone(),
            route: candidate.route.clone(),
            signal_type: Some(candidate.signal_type.as_str().to_string()),
            strength: Some(candidate.strength()),
            reason: reason.to_string(),
            details,
            recorded_at: Utc::now(),
        });
    }
}
