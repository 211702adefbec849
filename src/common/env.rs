//! Environment contract between the parent harness and the child process
//!
//! Everything the child needs beyond the command line travels through these
//! variables: remote-mode marker, home directory, port, URL prefix, and
//! timeout overrides.

use std::path::PathBuf;
use std::time::Duration;

use super::{Error, Result};

/// Marker variable; set to "1" when the process should run the remote bootstrap
pub const REMOTE: &str = "REMOTESTEP_REMOTE";

/// Absolute path of the session home directory
pub const HOME: &str = "REMOTESTEP_HOME";

/// Listening port allocated for the session
pub const PORT: &str = "REMOTESTEP_PORT";

/// URL path prefix the application serves under
pub const PREFIX: &str = "REMOTESTEP_PREFIX";

/// Overrides the server executable the launcher resolves
pub const SERVER_BIN: &str = "REMOTESTEP_SERVER_BIN";

/// Seconds the child waits for the application to become ready
pub const STARTUP_TIMEOUT_SECS: &str = "REMOTESTEP_STARTUP_TIMEOUT_SECS";

/// Seconds a single step may run before it is failed; unset means unbounded
pub const STEP_TIMEOUT_SECS: &str = "REMOTESTEP_STEP_TIMEOUT_SECS";

/// Default startup timeout when no override is configured
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Check whether this process was launched by the harness in remote mode
pub fn is_remote_invocation() -> bool {
    std::env::var(REMOTE).map(|v| v == "1").unwrap_or(false)
}

/// The session home directory, required in remote mode
pub fn home_dir() -> Result<PathBuf> {
    std::env::var_os(HOME)
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config(format!("{} is not set", HOME)))
}

/// The session port, required in remote mode
pub fn port() -> Result<u16> {
    let raw = std::env::var(PORT).map_err(|_| Error::Config(format!("{} is not set", PORT)))?;
    raw.parse()
        .map_err(|_| Error::Config(format!("{} is not a valid port: '{}'", PORT, raw)))
}

/// The URL path prefix, defaulting to "/"
pub fn prefix() -> String {
    std::env::var(PREFIX).unwrap_or_else(|_| "/".to_string())
}

/// Startup timeout, with the default applied
pub fn startup_timeout() -> Duration {
    secs_var(STARTUP_TIMEOUT_SECS).unwrap_or(DEFAULT_STARTUP_TIMEOUT)
}

/// Step timeout, if one was configured externally
pub fn step_timeout() -> Option<Duration> {
    secs_var(STEP_TIMEOUT_SECS)
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
