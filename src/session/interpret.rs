//! Outcome interpretation for a finished child process
//!
//! A step's fate is computable purely from the child's exit status and the
//! decoded outcome file. A nonzero exit always means the process itself died
//! - even a failed step exits 0 - so "step failed" and "process crashed" can
//! never be confused.

use std::process::ExitStatus;

use serde_json::Value;

use crate::common::{Error, Result};
use crate::protocol::StepOutcome;

/// Map (exit status, outcome file) to the step's result
///
/// | exit | outcome file       | result                       |
/// |------|--------------------|------------------------------|
/// | 0    | absent             | success, no return value     |
/// | 0    | success payload    | success, with return value   |
/// | 0    | failure payload    | rethrown reconstructed error |
/// | 0    | skipped payload    | skip signal                  |
/// | != 0 | any                | process crashed              |
pub fn interpret(
    step: &str,
    status: ExitStatus,
    outcome: Option<StepOutcome>,
    stderr_tail: &str,
) -> Result<Option<Value>> {
    if !status.success() {
        return Err(Error::ProcessCrashed {
            status: render_status(status),
            stderr_tail: stderr_tail.to_string(),
        });
    }

    match outcome {
        None => Ok(None),
        Some(StepOutcome::Success { value }) => Ok(value),
        Some(StepOutcome::Failure { failure }) => Err(Error::StepFailed {
            step: step.to_string(),
            failure,
        }),
        Some(StepOutcome::Skipped { reason }) => Err(Error::StepSkipped {
            step: step.to_string(),
            reason,
        }),
        Some(StepOutcome::Startup { rendered }) => Err(Error::Startup { rendered }),
        Some(StepOutcome::Protocol { message }) => Err(Error::Protocol(message)),
    }
}

fn render_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => status.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::RemoteFailure;
    use std::os::unix::process::ExitStatusExt;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn test_clean_exit_without_outcome_is_success() {
        let result = interpret("noop", exited(0), None, "").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_clean_exit_with_value_returns_it() {
        let outcome = StepOutcome::Success {
            value: Some(serde_json::json!(3)),
        };
        let result = interpret("count", exited(0), Some(outcome), "").unwrap();
        assert_eq!(result, Some(serde_json::json!(3)));
    }

    #[test]
    fn test_failure_payload_is_rethrown_with_attribution() {
        let outcome = StepOutcome::Failure {
            failure: RemoteFailure::new("error", "boom"),
        };
        let err = interpret("explode", exited(0), Some(outcome), "").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("'explode'"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn test_skip_payload_becomes_skip_signal() {
        let outcome = StepOutcome::Skipped {
            reason: "docker unavailable".into(),
        };
        let err = interpret("needs_docker", exited(0), Some(outcome), "").unwrap_err();
        assert!(err.is_skip());
        assert!(err.to_string().contains("docker unavailable"));
    }

    #[test]
    fn test_nonzero_exit_wins_over_any_outcome() {
        // Even a stale success payload cannot mask a crash
        let outcome = StepOutcome::Success { value: None };
        let err = interpret("crash", exited(7), Some(outcome), "segfault at 0x0").unwrap_err();
        match err {
            Error::ProcessCrashed {
                status,
                stderr_tail,
            } => {
                assert!(status.contains('7'));
                assert!(stderr_tail.contains("segfault"));
            }
            other => panic!("expected ProcessCrashed, got: {other}"),
        }
    }

    #[test]
    fn test_protocol_payload_is_fatal_local_error() {
        let outcome = StepOutcome::Protocol {
            message: "step handler 'x' not found during remote step decoding".into(),
        };
        let err = interpret("x", exited(0), Some(outcome), "").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
