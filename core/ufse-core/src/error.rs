//! Error types for configuration loading and incident delivery.
//!
//! The detection pipeline itself does not fail: its negative outcomes are
//! [`crate::discard::DiscardReason`] values. Only the I/O-facing edges
//! (reading config, compiling route patterns, writing incidents) produce errors.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum UfseError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Route Override Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid route pattern {pattern}: {details}")]
    InvalidRoutePattern { pattern: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Incident log unavailable: {path}: {source}")]
    IncidentLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UfseError>;

impl UfseError {
    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        UfseError::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
