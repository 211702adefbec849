//! Session lifecycle
//!
//! A session is a durable home directory plus a durable port. Every step
//! runs as a full launch-execute-interpret cycle of a fresh child process
//! against that same home and port, so consecutive steps see each other's
//! persisted state exactly as a restarted server would. A hard shutdown
//! swaps the home for a crash-consistent snapshot of itself.

pub mod dirs;
pub mod interpret;
pub mod snapshot;

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::common::{env as harness_env, Error, Result};
use crate::launcher::{self, LaunchSpec};
use crate::protocol::{self, StepRequest};

use dirs::DirAllocator;

/// Watchdog slack beyond the configured startup and step timeouts
const WATCHDOG_GRACE: Duration = Duration::from_secs(30);

/// Builder for [`Session`]
#[derive(Debug)]
pub struct SessionBuilder {
    name: String,
    spec: LaunchSpec,
    prefix: String,
    port: Option<u16>,
    step_timeout: Option<Duration>,
    startup_timeout: Duration,
}

impl SessionBuilder {
    /// Start building a session; the name prefixes all relayed child output
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: LaunchSpec::default(),
            prefix: "/".to_string(),
            port: None,
            step_timeout: None,
            startup_timeout: harness_env::DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Explicit path to the server executable
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.executable = Some(path.into());
        self
    }

    /// Executable name resolved via the install dir or PATH
    pub fn program(mut self, name: impl Into<String>) -> Self {
        self.spec.program = Some(name.into());
        self
    }

    /// Alternate runtime home containing `bin/<program>`
    pub fn install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.install_dir = Some(dir.into());
        self
    }

    /// Extra environment variable passed to every launch
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.extra_env.push((key.into(), value.into()));
        self
    }

    /// Extra command-line argument (debug/profiling flags)
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.extra_args.push(arg.into());
        self
    }

    /// URL path prefix the application serves under
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Fix the session port instead of allocating a free one
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Bound each step's execution inside the child
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Bound how long the child waits for the application to become ready
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Allocate the durable home directory and port and create the session
    pub fn build(self) -> Result<Session> {
        let mut dirs = DirAllocator::new(&self.name)?;
        let home = dirs.allocate("home")?;
        let port = match self.port {
            Some(port) => port,
            None => free_port()?,
        };

        tracing::info!(
            session = %self.name,
            home = %home.display(),
            port,
            "session created"
        );

        Ok(Session {
            name: self.name,
            spec: self.spec,
            prefix: self.prefix,
            home,
            port,
            step_timeout: self.step_timeout,
            startup_timeout: self.startup_timeout,
            dirs,
            launches: 0,
            disposed: false,
        })
    }
}

/// A logical test run with a durable home directory and port, spanning any
/// number of child process launches
#[derive(Debug)]
pub struct Session {
    name: String,
    spec: LaunchSpec,
    prefix: String,
    home: PathBuf,
    port: u16,
    step_timeout: Option<Duration>,
    startup_timeout: Duration,
    dirs: DirAllocator,
    launches: u32,
    disposed: bool,
}

impl Session {
    /// Start building a session
    pub fn builder(name: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(name)
    }

    /// The session's durable home directory
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The session's durable port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of child processes launched so far
    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Run one step against the application
    ///
    /// Performs a full cycle: plant the bootstrap hook, encode the step,
    /// launch the child against the durable home and port, block until it
    /// exits, and interpret exit code plus outcome file. State persisted by
    /// earlier steps is visible, exactly as across a server restart.
    pub async fn run_step(&mut self, step: &str, args: Value) -> Result<Option<Value>> {
        if self.disposed {
            return Err(Error::Internal(format!(
                "session '{}' already disposed",
                self.name
            )));
        }

        if !protocol::hook_present(&self.home) {
            protocol::plant_hook(&self.home, &self.name)?;
        }
        // A stale outcome from a crashed run must not be read as this
        // step's result
        let _ = std::fs::remove_file(protocol::outcome_path(&self.home));

        protocol::write_step(
            &self.home,
            &StepRequest {
                step: step.to_string(),
                args,
                timeout_secs: self.step_timeout.map(|t| t.as_secs()),
            },
        )?;

        let mut spec = self.spec.clone();
        spec.extra_env.push((
            harness_env::STARTUP_TIMEOUT_SECS.to_string(),
            self.startup_timeout.as_secs().to_string(),
        ));

        let mut child =
            launcher::launch(&spec, &self.home, self.port, &self.prefix, &self.name).await?;
        self.launches += 1;

        let status = match self.watchdog_limit() {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(
                        session = %self.name,
                        step,
                        limit_secs = limit.as_secs(),
                        "child did not exit in time; killing it"
                    );
                    let _ = child.kill().await;
                    return Err(Error::ProcessCrashed {
                        status: format!(
                            "killed by harness watchdog after {}s",
                            limit.as_secs()
                        ),
                        stderr_tail: child.stderr_tail(),
                    });
                }
            },
            None => child.wait().await?,
        };

        let outcome = protocol::take_outcome(&self.home)?;
        interpret::interpret(step, status, outcome, &child.stderr_tail())
    }

    /// Simulate an unclean crash
    ///
    /// Snapshots the home directory with a race-tolerant recursive copy; the
    /// snapshot then *becomes* the session home, so subsequent steps operate
    /// only on what had actually been flushed to disk.
    pub fn hard_shutdown(&mut self) -> Result<()> {
        let snapshot_dir = self.dirs.allocate("snapshot")?;
        let copied = snapshot::copy_tree(&self.home, &snapshot_dir)?;
        tracing::info!(
            session = %self.name,
            files = copied,
            from = %self.home.display(),
            to = %snapshot_dir.display(),
            "hard shutdown snapshot taken"
        );
        self.home = snapshot_dir;
        Ok(())
    }

    /// Create a scratch directory under the session root
    ///
    /// Unlike the home directory it is not durable: it removes itself when
    /// dropped, making it suitable for per-step staging data.
    pub fn scratch(&self) -> Result<tempfile::TempDir> {
        self.dirs.scratch()
    }

    /// Delete every directory the session allocated, best effort
    pub fn dispose(&mut self) {
        if !self.disposed {
            self.dirs.dispose();
            self.disposed = true;
        }
    }

    fn watchdog_limit(&self) -> Option<Duration> {
        // Without a step timeout the wait is unbounded by design; a caller
        // that wants a bound must configure one
        self.step_timeout
            .map(|step| self.startup_timeout + step + WATCHDOG_GRACE)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Allocate a free localhost port, durable for the session's lifetime
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_and_port_are_fixed_at_build_time() {
        let session = Session::builder("identity").build().unwrap();
        let home = session.home().to_path_buf();
        let port = session.port();

        // Accessors are stable across calls; launches do not reallocate
        assert_eq!(session.home(), home);
        assert_eq!(session.port(), port);
        assert!(port > 0);
    }

    #[test]
    fn test_hard_shutdown_rehomes_the_session() {
        let mut session = Session::builder("rehome").build().unwrap();
        let original_home = session.home().to_path_buf();
        std::fs::write(original_home.join("state.json"), b"{}").unwrap();

        session.hard_shutdown().unwrap();

        assert_ne!(session.home(), original_home);
        assert!(session.home().join("state.json").is_file());
        // Port is unchanged; only the directory moved
    }

    #[test]
    fn test_dispose_removes_all_session_dirs() {
        let mut session = Session::builder("cleanup").build().unwrap();
        let home = session.home().to_path_buf();
        session.hard_shutdown().unwrap();
        let snapshot_home = session.home().to_path_buf();

        session.dispose();
        assert!(!home.exists());
        assert!(!snapshot_home.exists());
    }

    #[test]
    fn test_scratch_dir_cleans_itself_up() {
        let session = Session::builder("scratch").build().unwrap();
        let scratch = session.scratch().unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(path.join("staging.bin"), b"x").unwrap();

        drop(scratch);
        assert!(!path.exists());
        // The durable home is unaffected
        assert!(session.home().is_dir());
    }

    #[tokio::test]
    async fn test_step_after_dispose_is_an_error() {
        let mut session = Session::builder("late").build().unwrap();
        session.dispose();
        let err = session
            .run_step("anything", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_watchdog_only_armed_with_step_timeout() {
        let unbounded = Session::builder("unbounded").build().unwrap();
        assert!(unbounded.watchdog_limit().is_none());

        let bounded = Session::builder("bounded")
            .step_timeout(Duration::from_secs(10))
            .startup_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let limit = bounded.watchdog_limit().unwrap();
        assert_eq!(limit, Duration::from_secs(45));
    }
}
