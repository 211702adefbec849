//! Reconstructed failures shipped across the process boundary
//!
//! An error raised inside the child is copied by value: message, rendered
//! stack frames, chained causes, and suppressed failures all survive the
//! trip. The concrete error type does not - the parent may not know it - so
//! only its textual name is preserved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frames beyond this are dropped from the captured backtrace
const MAX_FRAMES: usize = 40;

/// Deep copy of a failure raised inside the child process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Textual name of the failure kind ("panic", "timeout", an error type)
    pub kind: String,
    /// Original message, verbatim
    pub message: String,
    /// Rendered backtrace frames, innermost first
    #[serde(default)]
    pub frames: Vec<String>,
    /// Source location that defined the failing step, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Chained cause, outermost error first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RemoteFailure>>,
    /// Secondary failures recorded while handling the primary one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<RemoteFailure>,
}

impl RemoteFailure {
    /// Create a bare failure with no frames or causes
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            frames: Vec::new(),
            location: None,
            cause: None,
            suppressed: Vec::new(),
        }
    }

    /// Attach the source location that defined the failing step
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Attach rendered backtrace frames
    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: RemoteFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Record a secondary failure observed while handling this one
    pub fn push_suppressed(&mut self, failure: RemoteFailure) {
        self.suppressed.push(failure);
    }

    /// Reconstruct an error and its `source()` chain, capturing a backtrace
    /// at the point of reconstruction
    pub fn from_error(kind: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut failure = Self::new(kind, err.to_string()).with_frames(capture_frames());

        // Collect the source chain, then nest it back-to-front
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(s) = source {
            chain.push(Self::new("caused-by", s.to_string()));
            source = s.source();
        }
        let mut cause: Option<Box<RemoteFailure>> = None;
        for mut link in chain.into_iter().rev() {
            link.cause = cause;
            cause = Some(Box::new(link));
        }
        failure.cause = cause;
        failure
    }

    /// Reconstruct a panic payload
    pub fn from_panic(message: impl Into<String>) -> Self {
        Self::new("panic", message).with_frames(capture_frames())
    }
}

/// Capture the current backtrace as rendered frame lines
pub fn capture_frames() -> Vec<String> {
    let backtrace = std::backtrace::Backtrace::force_capture();
    backtrace
        .to_string()
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.is_empty())
        .take(MAX_FRAMES)
        .collect()
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, "\n    at {}", location)?;
        }
        for frame in &self.frames {
            write!(f, "\n    {}", frame)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "\ncaused by: {}", cause)?;
        }
        for suppressed in &self.suppressed {
            write!(f, "\nsuppressed: {}", suppressed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failed")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("inner broke: {0}")]
    struct Inner(String);

    #[test]
    fn test_source_chain_becomes_cause_chain() {
        let err = Outer {
            inner: Inner("disk full".into()),
        };
        let failure = RemoteFailure::from_error("Outer", &err);

        assert_eq!(failure.message, "outer failed");
        let cause = failure.cause.as_ref().expect("cause preserved");
        assert_eq!(cause.message, "inner broke: disk full");
        assert!(cause.cause.is_none());
    }

    #[test]
    fn test_display_renders_message_location_and_causes() {
        let failure = RemoteFailure::new("error", "boom")
            .with_location("tests/steps.rs:42")
            .with_cause(RemoteFailure::new("io", "pipe closed"));

        let text = failure.to_string();
        assert!(text.contains("error: boom"));
        assert!(text.contains("at tests/steps.rs:42"));
        assert!(text.contains("caused by: io: pipe closed"));
    }

    #[test]
    fn test_suppressed_failures_are_rendered() {
        let mut failure = RemoteFailure::new("error", "primary");
        failure.push_suppressed(RemoteFailure::new("cleanup", "temp dir left behind"));
        assert!(failure.to_string().contains("suppressed: cleanup: temp dir left behind"));
    }

    #[test]
    fn test_panic_capture_includes_frames() {
        let failure = RemoteFailure::from_panic("assertion failed");
        assert_eq!(failure.kind, "panic");
        assert!(!failure.frames.is_empty());
        assert!(failure.frames.len() <= MAX_FRAMES);
    }

    #[test]
    fn test_serde_roundtrip_preserves_structure() {
        let failure = RemoteFailure::new("error", "boom")
            .with_cause(RemoteFailure::new("io", "pipe closed"));
        let json = serde_json::to_string(&failure).unwrap();
        let back: RemoteFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cause.unwrap().message, "pipe closed");
    }
}
