//! Error types for the harness
//!
//! The taxonomy keeps the four terminal outcomes of a step cycle apart:
//! the application never became ready, the step's own logic threw, the step
//! signaled an unmet assumption, or the process died for unrelated reasons.
//! Protocol and configuration problems are always local, fatal errors.

use std::io;
use thiserror::Error;

use crate::protocol::RemoteFailure;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Startup Errors ===
    #[error("application failed to reach a ready state:\n{rendered}")]
    Startup { rendered: String },

    // === Step Errors ===
    #[error("step '{step}' failed in the server process:\n{failure}")]
    StepFailed {
        step: String,
        failure: RemoteFailure,
    },

    #[error("step '{step}' skipped: {reason}")]
    StepSkipped { step: String, reason: String },

    // === Process Errors ===
    #[error("server process terminated abnormally ({status}); recent stderr:\n{stderr_tail}")]
    ProcessCrashed {
        status: String,
        stderr_tail: String,
    },

    // === Protocol Errors ===
    #[error("protocol error: {0}")]
    Protocol(String),

    // === Configuration Errors ===
    #[error("configuration error: {0}")]
    Config(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error for a step name that no registry could resolve
    pub fn handler_not_found<S: AsRef<str>>(step: &str, searched: &[S]) -> Self {
        Self::Protocol(format!(
            "step handler '{}' not found during remote step decoding (searched registries: {})",
            step,
            searched
                .iter()
                .map(|s| s.as_ref())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Create a protocol error for an unreadable or malformed protocol file
    pub fn malformed_file(name: &str, detail: impl std::fmt::Display) -> Self {
        Self::Protocol(format!("malformed protocol file '{}': {}", name, detail))
    }

    /// True when the error represents a skip rather than a hard failure
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::StepSkipped { .. })
    }
}
