//! On-disk step/outcome protocol
//!
//! The parent writes a pending-step file into the session home; the child
//! writes an outcome file next to it before exiting. File presence plus the
//! child's exit code form the complete wire protocol - no other side channel
//! is consulted.

pub mod failure;

pub use failure::RemoteFailure;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

/// Filename of the pending step, relative to the session home
pub const STEP_FILE: &str = "pending-step.json";

/// Filename of the step outcome, relative to the session home
pub const OUTCOME_FILE: &str = "step-outcome.json";

/// Filename of the bootstrap hook planted before the first launch
pub const HOOK_FILE: &str = "bootstrap.json";

/// A unit of test logic shipped into the child process
///
/// A step is an explicit tagged value: the name of a statically registered
/// handler plus a separately serialized argument bundle. It is never a
/// closure over live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// Registered handler name
    pub step: String,
    /// Argument bundle passed to the handler
    #[serde(default)]
    pub args: serde_json::Value,
    /// Per-step timeout; overrides any externally configured default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Everything a step cycle can communicate back through the outcome file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step returned cleanly, optionally with a value
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// The step's own logic threw
    Failure { failure: RemoteFailure },
    /// The step signaled a precondition was not met
    Skipped { reason: String },
    /// The hosted application never reached a ready state
    Startup { rendered: String },
    /// The step could not be decoded or resolved in the child
    Protocol { message: String },
}

/// Bootstrap hook contents planted into the home directory
///
/// Its presence is the only coupling point that arms step execution in an
/// otherwise-unmodified child; the bootstrap refuses to run without it.
#[derive(Debug, Serialize, Deserialize)]
pub struct BootstrapHook {
    /// Session identifier, for log attribution
    pub session: String,
    /// Step file the bootstrap should read, relative to the home
    pub step_file: String,
    /// Outcome file the bootstrap should write, relative to the home
    pub outcome_file: String,
}

/// Path of the pending-step file inside a session home
pub fn step_path(home: &Path) -> PathBuf {
    home.join(STEP_FILE)
}

/// Path of the outcome file inside a session home
pub fn outcome_path(home: &Path) -> PathBuf {
    home.join(OUTCOME_FILE)
}

/// Path of the bootstrap hook file inside a session home
pub fn hook_path(home: &Path) -> PathBuf {
    home.join(HOOK_FILE)
}

/// Serialize a step request into the home directory, overwriting any prior one
pub fn write_step(home: &Path, request: &StepRequest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(request)?;
    std::fs::write(step_path(home), bytes)?;
    Ok(())
}

/// Read and decode the pending step file
pub fn read_step(home: &Path) -> Result<StepRequest> {
    let path = step_path(home);
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::malformed_file(STEP_FILE, format!("unreadable: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::malformed_file(STEP_FILE, e))
}

/// Serialize an outcome into the home directory
pub fn write_outcome(home: &Path, outcome: &StepOutcome) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(outcome)?;
    std::fs::write(outcome_path(home), bytes)?;
    Ok(())
}

/// Read and remove the outcome file, if one was written
///
/// Absence is a normal result (clean success with no return value); a file
/// that exists but cannot be decoded is a protocol error.
pub fn take_outcome(home: &Path) -> Result<Option<StepOutcome>> {
    let path = outcome_path(home);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let outcome =
        serde_json::from_slice(&bytes).map_err(|e| Error::malformed_file(OUTCOME_FILE, e))?;
    let _ = std::fs::remove_file(&path);
    Ok(Some(outcome))
}

/// Plant the bootstrap hook, arming step execution for this home directory
pub fn plant_hook(home: &Path, session: &str) -> Result<()> {
    let hook = BootstrapHook {
        session: session.to_string(),
        step_file: STEP_FILE.to_string(),
        outcome_file: OUTCOME_FILE.to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&hook)?;
    std::fs::write(hook_path(home), bytes)?;
    Ok(())
}

/// Check whether the bootstrap hook has been planted
pub fn hook_present(home: &Path) -> bool {
    hook_path(home).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_step_overwrites_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let first = StepRequest {
            step: "one".into(),
            args: json!({"n": 1}),
            timeout_secs: None,
        };
        let second = StepRequest {
            step: "two".into(),
            args: json!({"n": 2}),
            timeout_secs: Some(5),
        };
        write_step(dir.path(), &first).unwrap();
        write_step(dir.path(), &second).unwrap();

        let read = read_step(dir.path()).unwrap();
        assert_eq!(read.step, "two");
        assert_eq!(read.timeout_secs, Some(5));
    }

    #[test]
    fn test_missing_step_file_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_step(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got: {err}");
    }

    #[test]
    fn test_malformed_outcome_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(outcome_path(dir.path()), b"{ not json").unwrap();
        let err = take_outcome(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got: {err}");
    }

    #[test]
    fn test_take_outcome_consumes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write_outcome(
            dir.path(),
            &StepOutcome::Skipped {
                reason: "no database".into(),
            },
        )
        .unwrap();

        let first = take_outcome(dir.path()).unwrap();
        assert!(matches!(first, Some(StepOutcome::Skipped { .. })));
        let second = take_outcome(dir.path()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_hook_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!hook_present(dir.path()));
        plant_hook(dir.path(), "session-1").unwrap();
        assert!(hook_present(dir.path()));
    }
}
