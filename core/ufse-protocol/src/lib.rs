//! Data model and IPC protocol for the frustration-signal engine.
//!
//! Shared by the engine, the daemon and any client that submits events, so
//! the wire shape of events, sessions and incidents lives in exactly one place.
//! The engine remains the authority on admission; clients reuse these types to
//! build well-formed requests.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_EVENTS_PER_REQUEST: usize = 1000;
/// Incidents sharing an idempotency key are duplicates within this many seconds.
pub const DUPLICATE_WINDOW_SECS: i64 = 5 * 60;

/// Parses an RFC3339 timestamp into UTC. Returns `None` for anything malformed.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// The element an interaction was aimed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl Target {
    pub fn new(target_type: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            id: None,
            selector: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Stable identity used to group interactions: id, then selector, then type.
    pub fn identity(&self) -> &str {
        non_empty(&self.id)
            .or_else(|| non_empty(&self.selector))
            .unwrap_or(self.target_type.as_str())
    }

    pub fn id_or_selector(&self) -> Option<&str> {
        non_empty(&self.id).or_else(|| non_empty(&self.selector))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|candidate| !candidate.trim().is_empty())
}

/// One raw user-interaction event. Immutable once admitted into a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        timestamp: impl Into<String>,
        session_id: impl Into<String>,
        route: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: timestamp.into(),
            session_id: session_id.into(),
            route: route.into(),
            target: Target::default(),
            metadata: Map::new(),
            idempotency_key: None,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Boolean metadata; a missing or non-boolean value reads as `false`.
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key)? {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    /// HTTP status carried in metadata, accepting numbers or numeric strings.
    pub fn http_status(&self) -> Option<u16> {
        self.metadata_f64("status")
            .filter(|status| (0.0..=999.0).contains(status))
            .map(|status| status as u16)
    }

    pub fn is_success_response(&self) -> bool {
        matches!(self.http_status(), Some(200..=299))
    }

    /// Explicit client-side session reset marker.
    pub fn is_reset(&self) -> bool {
        self.is_type("navigation") && self.metadata_flag("reset")
    }

    /// Key used to collapse duplicates: the client idempotency key when present,
    /// otherwise type, timestamp, session, route and target identity. Parseable
    /// timestamps are normalised to UTC so one instant written two ways matches.
    pub fn fingerprint(&self) -> String {
        if let Some(key) = non_empty(&self.idempotency_key) {
            return key.to_string();
        }
        let timestamp = match self.parsed_timestamp() {
            Some(parsed) => parsed.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            None => self.timestamp.clone(),
        };
        let mut fingerprint = format!(
            "{}:{}:{}:{}:{}",
            self.event_type, timestamp, self.session_id, self.route, self.target.target_type
        );
        if let Some(id) = non_empty(&self.target.id) {
            fingerprint.push(':');
            fingerprint.push_str(id);
        }
        if let Some(selector) = non_empty(&self.target.selector) {
            fingerprint.push(':');
            fingerprint.push_str(selector);
        }
        fingerprint
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Completed,
}

impl SessionStatus {
    /// Allowed edges of the lifecycle. Completed is terminal.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Idle)
                | (SessionStatus::Idle, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Idle, SessionStatus::Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTransition {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable snapshot of a completed session, handed to the detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub events: Vec<Event>,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub route_transitions: Vec<RouteTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Session {
    /// Bare session over pre-ordered events, used for offline replay and tests.
    pub fn from_events(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        events: Vec<Event>,
    ) -> Self {
        let timestamps: Vec<DateTime<Utc>> =
            events.iter().filter_map(Event::parsed_timestamp).collect();
        let start_time = timestamps.iter().min().copied().unwrap_or_else(Utc::now);
        let last_activity = timestamps.iter().max().copied().unwrap_or(start_time);
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            status: SessionStatus::Completed,
            events,
            start_time,
            last_activity,
            end_time: Some(last_activity),
            route_transitions: Vec::new(),
            completion_reason: None,
            metadata: Map::new(),
        }
    }

    /// User agent reported by any event in the session.
    pub fn user_agent(&self) -> Option<&str> {
        self.events
            .iter()
            .find_map(|event| event.metadata_str("userAgent"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Incidents
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::High => "High",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeverityType {
    #[serde(rename = "Dark Pattern")]
    DarkPattern,
    Bug,
    Performance,
    #[serde(rename = "UX")]
    Ux,
}

impl SeverityType {
    pub fn as_str(self) -> &'static str {
        match self {
            SeverityType::DarkPattern => "Dark Pattern",
            SeverityType::Bug => "Bug",
            SeverityType::Performance => "Performance",
            SeverityType::Ux => "UX",
        }
    }
}

impl fmt::Display for SeverityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-signal evidence attached to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDetail {
    pub signal_type: String,
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub strength: f64,
    pub is_system_feedback: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub incident_id: Uuid,
    pub session_id: String,
    pub project_id: String,
    pub frustration_score: u8,
    pub confidence_level: ConfidenceLevel,
    pub triggering_signals: Vec<String>,
    pub primary_failure_point: String,
    pub severity_type: SeverityType,
    pub timestamp: DateTime<Utc>,
    pub explanation: String,
    pub signal_details: Vec<SignalDetail>,
}

impl Incident {
    /// Downstream deduplication key. Stable across re-processing of the same session.
    /// Two incidents sharing a key are only duplicates when their detection times
    /// fall within [`DUPLICATE_WINDOW_SECS`] of each other.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.session_id, self.primary_failure_point)
    }

    /// When the struggle began: the earliest triggering signal, else emission time.
    pub fn detected_at(&self) -> DateTime<Utc> {
        self.signal_details
            .iter()
            .map(|detail| detail.timestamp)
            .min()
            .unwrap_or(self.timestamp)
    }

    pub fn is_duplicate_window(first: DateTime<Utc>, second: DateTime<Utc>) -> bool {
        (first - second).num_seconds().abs() <= DUPLICATE_WINDOW_SECS
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IPC envelope
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetMetrics,
    Ingest,
    Flush,
    /// Drains open sessions to the incident sink, then stops the daemon.
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self::error_with_info(id, ErrorInfo::new(code, message))
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// A batch of events for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestRequest {
    pub project_id: String,
    pub session_id: String,
    pub events: Vec<Event>,
}

impl IngestRequest {
    /// Structural checks only. Timestamps are not validated here: malformed
    /// ones are tolerated downstream and keep their ingestion order.
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(&self.project_id, "projectId")?;
        require_string(&self.session_id, "sessionId")?;
        if self.session_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_session_id",
                "sessionId must be 128 characters or fewer",
            ));
        }
        if self.events.is_empty() {
            return Err(ErrorInfo::new("missing_field", "events must not be empty"));
        }
        if self.events.len() > MAX_EVENTS_PER_REQUEST {
            return Err(ErrorInfo::new(
                "too_many_events",
                format!("at most {} events per request", MAX_EVENTS_PER_REQUEST),
            ));
        }
        for event in &self.events {
            require_string(&event.event_type, "type")?;
        }
        Ok(())
    }
}

pub fn parse_ingest(params: Value) -> Result<IngestRequest, ErrorInfo> {
    let request: IngestRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("ingest payload is invalid: {}", err),
        )
    })?;
    request.validate()?;
    Ok(request)
}

fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}
