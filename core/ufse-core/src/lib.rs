//! # ufse-core
//!
//! Deterministic detection of user-frustration incidents from raw interaction
//! events.
//!
//! Two halves:
//!
//! - [`session`]: a concurrent store that admits out-of-order, duplicate and
//!   clock-skewed events, decides when a session is done, and hands completed
//!   sessions off through a bounded queue.
//! - [`pipeline`]: a synchronous run over one completed session: classify,
//!   detect candidates, filter false alarms, qualify, correlate, score, resolve
//!   the failure point, explain and emit.
//!
//! ## Design Principles
//!
//! - **No randomness, no models**: the same session always yields the same
//!   groups, scores and discard reasons. Only incident ids and emission times
//!   differ between runs.
//! - **Discards, not errors**: a session that produces nothing ends with a
//!   typed [`DiscardReason`]. Errors are reserved for I/O edges (config files,
//!   route patterns, incident sinks).
//! - **Immutable configuration**: [`DetectionConfig`] is a snapshot taken at
//!   construction; collaborators (shadow recorder, audit log, observer) are
//!   caller-owned and passed in.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ufse_core::{DetectionConfig, NoopObserver, Pipeline};
//!
//! let pipeline = Pipeline::new(DetectionConfig::default(), Arc::new(NoopObserver))?;
//! let report = pipeline.process(&session);
//! for incident in report.emitted { /* forward */ }
//! ```

pub mod audit;
pub mod classify;
pub mod config;
pub mod correlate;
pub mod discard;
pub mod emit;
pub mod error;
pub mod explain;
pub mod failure_point;
pub mod false_alarm;
pub mod forwarding;
pub mod observability;
pub mod pipeline;
pub mod qualify;
pub mod routes;
pub mod scoring;
pub mod session;
pub mod shadow;
pub mod signals;

pub use audit::{SuppressionAuditLog, SuppressionRecord, SuppressionSummary};
pub use classify::{classify, classify_session, ClassifiedEvent, EventCategory};
pub use config::{
    default_config_path, load_detection_config, DetectionConfig, EngineMode, Sensitivity,
    SessionLimits,
};
pub use correlate::{correlate, CorrelatedGroup};
pub use discard::DiscardReason;
pub use error::{Result, UfseError};
pub use false_alarm::FalseAlarmReason;
pub use forwarding::{
    CancellationToken, ForwardOutcome, Forwarder, IncidentSink, JsonlIncidentSink, MemorySink,
    RetryPolicy, SinkError,
};
pub use observability::{InMemoryObserver, MetricsSnapshot, NoopObserver, Observer};
pub use pipeline::{Pipeline, PipelineReport};
pub use qualify::QualifiedSignal;
pub use routes::{MergedRouteConfig, RouteConfig, RouteConfigManager};
pub use session::{CompletionReason, IngestOutcome, SessionManager, StoreSnapshot};
pub use shadow::{ShadowIncident, ShadowMetrics, ShadowModeManager};
pub use signals::{CandidateSignal, SignalType};
