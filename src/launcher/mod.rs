//! Child process launching and output relay
//!
//! Composes the server invocation (executable, port/prefix flags, home
//! directory and extra environment), spawns it, and relays its output back
//! to the parent's streams with a session-identifying prefix so interleaved
//! output from concurrent sessions stays attributable.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::common::{env as harness_env, Error, Result};

/// Number of trailing stderr lines retained for crash reports
const STDERR_TAIL_LINES: usize = 50;

/// How the server process is composed
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Explicit path to the server executable
    pub executable: Option<PathBuf>,
    /// Executable name, resolved via the install dir or PATH
    pub program: Option<String>,
    /// Alternate runtime home containing `bin/<program>`
    pub install_dir: Option<PathBuf>,
    /// Extra environment variables for the child
    pub extra_env: Vec<(String, String)>,
    /// Extra command-line arguments (debug/profiling flags)
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    /// Resolve the server executable
    ///
    /// Order: explicit path, then the `REMOTESTEP_SERVER_BIN` override, then
    /// `<install_dir>/bin/<program>`, then `program` looked up on PATH. A
    /// path that does not exist is a configuration error raised before any
    /// attempt to wait for readiness.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = &self.executable {
            return require_exists(path);
        }

        if let Some(raw) = std::env::var_os(harness_env::SERVER_BIN) {
            return require_exists(&PathBuf::from(raw));
        }

        if let (Some(dir), Some(name)) = (&self.install_dir, &self.program) {
            let candidate = dir.join("bin").join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        if let Some(name) = &self.program {
            return which::which(name).map_err(|_| {
                Error::Config(format!("server executable '{}' not found on PATH", name))
            });
        }

        Err(Error::Config(
            "no server executable configured; set an explicit path or a program name".to_string(),
        ))
    }
}

fn require_exists(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::Config(format!(
            "server executable '{}' does not exist",
            path.display()
        )))
    }
}

/// Owns one launched server process and its output relays
pub struct ChildProcessHandle {
    child: Child,
    stdout_relay: Option<JoinHandle<()>>,
    stderr_relay: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Launch the server process for one step cycle
///
/// The child is pointed at the session home via the environment, given the
/// session's durable port and prefix as flags, and marked for remote-mode
/// execution. Spawn failures are configuration errors, raised fast.
pub async fn launch(
    spec: &LaunchSpec,
    home: &Path,
    port: u16,
    prefix: &str,
    session_id: &str,
) -> Result<ChildProcessHandle> {
    let executable = spec.resolve_executable()?;

    tracing::info!(
        executable = %executable.display(),
        home = %home.display(),
        port,
        session = session_id,
        "launching server process"
    );

    let mut command = Command::new(&executable);
    command
        .arg("--port")
        .arg(port.to_string())
        .arg("--prefix")
        .arg(prefix)
        .args(&spec.extra_args)
        .env(harness_env::REMOTE, "1")
        .env(harness_env::HOME, home)
        .env(harness_env::PORT, port.to_string())
        .env(harness_env::PREFIX, prefix)
        .envs(spec.extra_env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        Error::Config(format!(
            "failed to spawn server process '{}': {}",
            executable.display(),
            e
        ))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("child stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("child stderr was not piped".to_string()))?;

    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

    let label = session_id.to_string();
    let stdout_relay = tokio::spawn(relay_lines(stdout, label.clone(), None));
    let stderr_relay = tokio::spawn(relay_lines(stderr, label, Some(stderr_tail.clone())));

    Ok(ChildProcessHandle {
        child,
        stdout_relay: Some(stdout_relay),
        stderr_relay: Some(stderr_relay),
        stderr_tail,
    })
}

impl ChildProcessHandle {
    /// Wait for the process to exit, draining both output relays first
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        for relay in [self.stdout_relay.take(), self.stderr_relay.take()]
            .into_iter()
            .flatten()
        {
            let _ = relay.await;
        }
        Ok(status)
    }

    /// Forcibly terminate the process (parent-side watchdog)
    ///
    /// Joins both output relays after the kill so the stderr tail contains
    /// everything the child managed to write before dying.
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        for relay in [self.stdout_relay.take(), self.stderr_relay.take()]
            .into_iter()
            .flatten()
        {
            let _ = relay.await;
        }
        Ok(())
    }

    /// Recent stderr output, for crash reports
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Copy child output to the parent's streams line by line
///
/// Runs until the child closes the pipe, keeping the child from ever
/// blocking on a full buffer. stderr lines are additionally retained in a
/// bounded tail ring.
async fn relay_lines<R: AsyncRead + Unpin>(
    reader: R,
    label: String,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match &tail {
                    Some(tail) => {
                        eprintln!("[{}] {}", label, line);
                        let mut ring = tail.lock().unwrap_or_else(|e| e.into_inner());
                        if ring.len() == STDERR_TAIL_LINES {
                            ring.pop_front();
                        }
                        ring.push_back(line);
                    }
                    None => println!("[{}] {}", label, line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session = %label, error = %e, "output relay ended");
                break;
            }
        }
    }
}
