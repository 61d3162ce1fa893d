use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use ufse_core::explain::REVIEW_PREFIX;
use ufse_core::observability::{INCIDENTS_EMITTED, SESSIONS_PROCESSED, SIGNALS_DISCARDED};
use ufse_core::{
    DetectionConfig, DiscardReason, EngineMode, InMemoryObserver, NoopObserver, Pipeline,
    RouteConfig,
};
use ufse_protocol::{parse_timestamp, ConfidenceLevel, Event, Session, SeverityType, Target};

fn t0() -> DateTime<Utc> {
    parse_timestamp("2026-01-30T12:00:00Z").expect("t0")
}

fn event(event_type: &str, offset_ms: i64, route: &str) -> Event {
    let timestamp = (t0() + Duration::milliseconds(offset_ms)).to_rfc3339();
    Event::new(event_type, timestamp, "session-1", route)
}

fn click(offset_ms: i64, route: &str, target_type: &str, id: &str) -> Event {
    event("click", offset_ms, route).with_target(Target::new(target_type).with_id(id))
}

fn session(events: Vec<Event>) -> Session {
    Session::from_events("session-1", "project-1", events)
}

fn pipeline(config: DetectionConfig) -> Pipeline {
    Pipeline::new(config, Arc::new(NoopObserver)).expect("pipeline")
}

/// Four clicks on one button, 100ms apart, optionally followed by an error.
fn click_burst(route: &str, with_error: bool) -> Vec<Event> {
    let mut events: Vec<Event> = (0..4)
        .map(|i| click(i * 100, route, "button", "submit-btn"))
        .collect();
    if with_error {
        events.push(event("error", 1_500, route).with_metadata("message", "Payment declined"));
    }
    events
}

#[test]
fn checkout_rage_with_error_emits_reviewable_incident() {
    let report =
        pipeline(DetectionConfig::default()).process(&session(click_burst("/checkout/pay", true)));

    assert_eq!(report.emitted.len(), 1, "discards: {:?}", report.discards);
    let incident = &report.emitted[0];
    assert_eq!(incident.confidence_level, ConfidenceLevel::Medium);
    assert_eq!(incident.severity_type, SeverityType::Bug);
    assert_eq!(incident.triggering_signals, vec!["rage".to_string()]);
    assert_eq!(incident.primary_failure_point, "/checkout/pay:submit-btn:rage");
    assert!(incident.explanation.starts_with(REVIEW_PREFIX));
    assert_eq!(incident.signal_details.len(), 1);
    assert!(incident.signal_details[0].strength >= 0.8);
    assert!(incident.frustration_score > 0 && incident.frustration_score <= 100);
}

#[test]
fn checkout_rage_without_error_has_no_cause() {
    let report =
        pipeline(DetectionConfig::default()).process(&session(click_burst("/checkout/pay", false)));

    assert!(report.emitted.is_empty());
    assert_eq!(report.candidate_count, 1);
    assert!(report.discarded(DiscardReason::QualificationFailed));
}

#[test]
fn medium_tier_rage_alone_does_not_correlate() {
    let report = pipeline(DetectionConfig::default()).process(&session(click_burst("/home", true)));

    assert!(report.emitted.is_empty());
    assert_eq!(report.qualified_count, 1);
    assert!(report.discarded(DiscardReason::CorrelationFailed));
}

#[test]
fn repeated_rejected_signup_is_high_confidence() {
    let submit = |offset_ms| {
        event("form_submit", offset_ms, "/signup").with_target(Target::new("form").with_id("signup"))
    };
    let failure =
        |offset_ms| event("error", offset_ms, "/signup").with_metadata("message", "Validation failed");
    let report = pipeline(DetectionConfig::default()).process(&session(vec![
        submit(0),
        failure(1_000),
        submit(3_000),
        failure(4_000),
    ]));

    assert_eq!(report.emitted.len(), 1, "discards: {:?}", report.discards);
    let incident = &report.emitted[0];
    assert_eq!(incident.confidence_level, ConfidenceLevel::High);
    assert_eq!(
        incident.triggering_signals,
        vec!["blocked".to_string(), "abandonment".to_string()]
    );
    assert_eq!(incident.primary_failure_point, "/signup:signup:form_submit");
    assert_eq!(incident.severity_type, SeverityType::Bug);
    assert!(!incident.explanation.starts_with(REVIEW_PREFIX));
    assert!(incident.signal_details.iter().any(|detail| detail.is_system_feedback));
}

#[test]
fn lone_abandonment_is_audited_as_uncorrelated() {
    let pipeline = pipeline(DetectionConfig::default());
    let report = pipeline.process(&session(vec![
        event("navigation", 0, "/checkout"),
        event("error", 5_000, "/checkout").with_metadata("message", "payment failed"),
    ]));

    assert!(report.emitted.is_empty());
    assert_eq!(report.qualified_count, 1);
    assert!(report.discarded(DiscardReason::CorrelationFailed));
    let summary = pipeline.audit().summary();
    assert_eq!(summary.by_reason.get("correlation_failed"), Some(&1));
    assert_eq!(summary.by_signal_type.get("abandonment"), Some(&1));
}

#[test]
fn route_oscillation_alone_is_not_an_incident() {
    let events = (0..6)
        .map(|i| {
            let route = if i % 2 == 0 { "/products" } else { "/cart" };
            event("navigation", i * 5_000, route)
        })
        .collect();
    let report = pipeline(DetectionConfig::default()).process(&session(events));

    assert!(report.emitted.is_empty());
    assert_eq!(report.vetoed_count, 0);
    assert_eq!(report.qualified_count, 1);
    assert!(report.discarded(DiscardReason::CorrelationFailed));
}

#[test]
fn double_click_then_navigation_is_not_an_incident() {
    let pipeline = pipeline(DetectionConfig::default());
    let report = pipeline.process(&session(vec![
        click(0, "/files/browse", "li", "file-item-1"),
        click(200, "/files/browse", "li", "file-item-1"),
        event("navigation", 1_000, "/files/browse").with_metadata("to", "/files/file-item-1"),
    ]));

    assert!(report.emitted.is_empty());
    assert!(report.shadowed.is_empty());
    assert_eq!(report.candidate_count, 0);
    assert_eq!(report.qualified_count, 0);
    assert_eq!(report.discards, vec![DiscardReason::NoCandidates]);
}

#[test]
fn pipeline_refuses_oversized_windows() {
    let mut config = DetectionConfig::default();
    config.correlation.time_window_secs = u64::MAX / 2;
    assert!(Pipeline::new(config, Arc::new(NoopObserver)).is_err());
}

#[test]
fn double_click_is_vetoed_even_when_route_lowers_rage_threshold() {
    let config = DetectionConfig {
        routes: vec![RouteConfig {
            rage_min_clicks: Some(2),
            ..RouteConfig::new("/files/**", 50)
        }],
        ..DetectionConfig::default()
    };
    let pipeline = pipeline(config);
    let report = pipeline.process(&session(vec![
        click(0, "/files/browse", "li", "file-item-1"),
        click(200, "/files/browse", "li", "file-item-1"),
        event("navigation", 1_000, "/files/browse").with_metadata("to", "/files/file-item-1"),
    ]));

    assert_eq!(report.candidate_count, 1);
    assert_eq!(report.vetoed_count, 1);
    assert_eq!(report.qualified_count, 0);
    assert!(report.discarded(DiscardReason::NoCandidates));
    let recent = pipeline.audit().recent(10);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].reason, "double_click");
}

#[test]
fn shadow_route_records_instead_of_emitting() {
    let pipeline = pipeline(DetectionConfig::default());
    let mut events: Vec<Event> = (0..5)
        .map(|i| click(i * 100, "/admin/users", "button", "save"))
        .collect();
    events.push(event("error", 1_500, "/admin/users"));
    let report = pipeline.process(&session(events));

    assert!(report.emitted.is_empty());
    assert_eq!(report.shadowed.len(), 1);
    let metrics = pipeline.shadow().metrics();
    assert_eq!(metrics.total_detections, 1);
    assert_eq!(metrics.would_emit, 1);
    assert_eq!(metrics.by_route.get("/admin/users"), Some(&1));
    assert_eq!(pipeline.shadow().by_route("/admin/users", 10).len(), 1);
    assert_eq!(pipeline.audit().summary().by_reason.get("shadow_mode"), Some(&1));
}

#[test]
fn global_shadow_mode_never_emits() {
    let config = DetectionConfig {
        engine: ufse_core::config::EngineConfig {
            mode: EngineMode::Shadow,
            ..Default::default()
        },
        ..DetectionConfig::default()
    };
    let pipeline = pipeline(config);
    let report = pipeline.process(&session(click_burst("/checkout/pay", true)));

    assert!(report.emitted.is_empty());
    assert_eq!(report.shadowed.len(), 1);
    assert_eq!(pipeline.shadow().stored(), 1);
}

#[test]
fn disabled_route_suppresses_candidates() {
    let pipeline = pipeline(DetectionConfig::default());
    let mut events: Vec<Event> = (0..5)
        .map(|i| click(i * 100, "/api/orders", "button", "retry"))
        .collect();
    events.push(event("error", 1_000, "/api/orders"));
    let report = pipeline.process(&session(events));

    assert_eq!(report.disabled_count, 1);
    assert!(report.discarded(DiscardReason::NoCandidates));
    let recent = pipeline.audit().recent(1);
    assert_eq!(recent[0].reason, "route_disabled");
    assert_eq!(recent[0].details, "/api/**");
}

#[test]
fn empty_session_is_discarded_with_no_events() {
    let report = pipeline(DetectionConfig::default()).process(&session(Vec::new()));
    assert_eq!(report.discards, vec![DiscardReason::NoEvents]);
    assert_eq!(report.candidate_count, 0);
}

#[test]
fn observer_sees_processing_and_emission() {
    let observer = Arc::new(InMemoryObserver::new());
    let pipeline = Pipeline::new(DetectionConfig::default(), observer.clone()).expect("pipeline");
    pipeline.process(&session(click_burst("/checkout/pay", true)));
    pipeline.process(&session(click_burst("/checkout/pay", false)));

    let snapshot = observer.snapshot();
    assert_eq!(snapshot.counter(SESSIONS_PROCESSED, None), 2);
    assert_eq!(snapshot.counter(INCIDENTS_EMITTED, Some("Bug")), 1);
    assert_eq!(snapshot.counter(SIGNALS_DISCARDED, Some("qualification_failed")), 1);
}

#[test]
fn identical_sessions_produce_identical_outcomes() {
    let pipeline = pipeline(DetectionConfig::default());
    let first = pipeline.process(&session(click_burst("/checkout/pay", true)));
    let second = pipeline.process(&session(click_burst("/checkout/pay", true)));

    assert_eq!(first.discards, second.discards);
    assert_eq!(first.emitted.len(), second.emitted.len());
    let (a, b) = (&first.emitted[0], &second.emitted[0]);
    assert_ne!(a.incident_id, b.incident_id);
    assert_eq!(a.frustration_score, b.frustration_score);
    assert_eq!(a.explanation, b.explanation);
    assert_eq!(a.primary_failure_point, b.primary_failure_point);
}

const EVENT_TYPES: [&str; 7] = [
    "click",
    "click",
    "form_submit",
    "error",
    "navigation",
    "scroll",
    "network_error",
];
const ROUTES: [&str; 4] = ["/checkout/pay", "/signup", "/products", "/cart"];
const TARGETS: [&str; 3] = ["submit-btn", "save", "signup"];

fn arbitrary_event() -> impl Strategy<Value = (usize, usize, usize, i64)> {
    (0..EVENT_TYPES.len(), 0..ROUTES.len(), 0..TARGETS.len(), 0i64..60_000)
}

proptest! {
    #[test]
    fn emitted_incidents_always_satisfy_correlation_rules(
        mut raw in proptest::collection::vec(arbitrary_event(), 0..40)
    ) {
        raw.sort_by_key(|(_, _, _, offset_ms)| *offset_ms);
        let events = raw
            .into_iter()
            .map(|(kind, route, target, offset_ms)| {
                event(EVENT_TYPES[kind], offset_ms, ROUTES[route])
                    .with_target(Target::new("button").with_id(TARGETS[target]))
            })
            .collect();
        let report = pipeline(DetectionConfig::default()).process(&session(events));

        for incident in &report.emitted {
            prop_assert!(incident.confidence_level >= ConfidenceLevel::Medium);
            prop_assert!(incident.frustration_score <= 100);
            let details = &incident.signal_details;
            let correlated = details.len() >= 2 && details.iter().any(|d| d.is_system_feedback);
            let strong_single = details.len() == 1 && details[0].strength >= 0.8;
            prop_assert!(correlated || strong_single);
            prop_assert_eq!(incident.primary_failure_point.split(':').count(), 3);
        }
        prop_assert!(!report.emitted.is_empty() || !report.discards.is_empty());
    }
}
