//! Remote execution bootstrap - runs inside the child process
//!
//! Once the hosted application is ready, the bootstrap reads the pending
//! step planted by the parent, resolves it against the step registries,
//! invokes it with a handle to the live application, and writes the outcome
//! file before requesting an orderly shutdown. The process exits 0 on every
//! orderly run - step failure travels only through the outcome file, so
//! "step failed" and "process crashed" stay distinguishable.

pub mod registry;

pub use registry::{StepError, StepRegistry, StepResolver, StepResult};

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::common::{env as harness_env, Error, Result};
use crate::protocol::{self, RemoteFailure, StepOutcome, StepRequest};
use registry::StepHandler;

/// How often the readiness probe retries
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-request timeout for readiness probes
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest startup-response excerpt kept for failure rendering
const READY_BODY_EXCERPT: usize = 2048;

/// Exit code for bootstrap failures that could not be reported via the
/// outcome file
const EXIT_BOOTSTRAP_FAILURE: i32 = 70;

/// Bootstrap phases, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the pending-step file to be read
    AwaitingStep,
    /// Deserializing and resolving the step
    Decoding,
    /// The step is running against the live application
    Executing,
    /// Writing the outcome and shutting the application down
    Finishing,
    /// Ready to terminate the process
    ExitRequested,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingStep => write!(f, "awaiting-step"),
            Self::Decoding => write!(f, "decoding"),
            Self::Executing => write!(f, "executing"),
            Self::Finishing => write!(f, "finishing"),
            Self::ExitRequested => write!(f, "exit-requested"),
        }
    }
}

/// Handle to the live application, passed to every step handler
#[derive(Debug, Clone)]
pub struct AppHandle {
    base_url: String,
    home: PathBuf,
    port: u16,
    capabilities: Arc<HashMap<String, String>>,
}

impl AppHandle {
    /// Create a handle; used by the bootstrap and by tests
    pub fn new(
        base_url: String,
        home: PathBuf,
        port: u16,
        capabilities: HashMap<String, String>,
    ) -> Self {
        Self {
            base_url,
            home,
            port,
            capabilities: Arc::new(capabilities),
        }
    }

    /// Base URL the application serves
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session home directory
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Session port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Query an optional host capability by name
    ///
    /// Explicit present/absent result; handlers must not probe for features
    /// by catching failures.
    pub fn capability(&self, name: &str) -> Option<&str> {
        self.capabilities.get(name).map(String::as_str)
    }

    /// Whether the host advertises a capability
    pub fn supports(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }
}

/// Context handed to the application boot function
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Session home directory
    pub home: PathBuf,
    /// Port the application must listen on
    pub port: u16,
    /// URL path prefix the application must serve under
    pub prefix: String,
}

/// A hosted application the bootstrap can drive
#[async_trait]
pub trait HostedApp: Send {
    /// URL the application serves once ready
    fn base_url(&self) -> String;

    /// Optional feature flags advertised to step handlers
    fn capabilities(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Orderly shutdown
    async fn shutdown(self: Box<Self>) -> Result<()>;
}

/// Check whether this process was launched by the harness in remote mode
pub fn is_remote_invocation() -> bool {
    harness_env::is_remote_invocation()
}

/// Child-side entry point: boot the application, execute the pending step,
/// report the outcome, and terminate the process
///
/// Exits 0 on every orderly run, including a failed step; a nonzero exit
/// means the bootstrap itself could not complete.
pub async fn run<F, Fut>(resolver: StepResolver, boot: F)
where
    F: FnOnce(AppContext) -> Fut,
    Fut: Future<Output = Result<Box<dyn HostedApp>>>,
{
    let mut phase = Phase::AwaitingStep;
    let code = match run_inner(resolver, boot, &mut phase).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(phase = %phase, error = %e, "remote bootstrap failed");
            EXIT_BOOTSTRAP_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run_inner<F, Fut>(resolver: StepResolver, boot: F, phase: &mut Phase) -> Result<()>
where
    F: FnOnce(AppContext) -> Fut,
    Fut: Future<Output = Result<Box<dyn HostedApp>>>,
{
    let home = harness_env::home_dir()?;

    tracing::debug!(phase = %*phase, home = %home.display(), "remote bootstrap starting");
    if !protocol::hook_present(&home) {
        return Err(Error::Protocol(
            "bootstrap hook file missing; refusing to run in remote mode".to_string(),
        ));
    }

    *phase = Phase::Decoding;
    tracing::debug!(phase = %*phase, "reading pending step");
    let request = match protocol::read_step(&home) {
        Ok(request) => request,
        Err(e) => {
            // Report decode failures through the outcome file so the parent
            // can distinguish them from application-level failures
            protocol::write_outcome(
                &home,
                &StepOutcome::Protocol {
                    message: e.to_string(),
                },
            )?;
            return Ok(());
        }
    };

    let handler = match resolver.resolve(&request.step) {
        Ok(handler) => handler.clone(),
        Err(e) => {
            protocol::write_outcome(
                &home,
                &StepOutcome::Protocol {
                    message: e.to_string(),
                },
            )?;
            return Ok(());
        }
    };

    let context = AppContext {
        home: home.clone(),
        port: harness_env::port()?,
        prefix: harness_env::prefix(),
    };

    let app = match boot(context).await {
        Ok(app) => app,
        Err(e) => {
            protocol::write_outcome(
                &home,
                &StepOutcome::Startup {
                    rendered: e.to_string(),
                },
            )?;
            return Ok(());
        }
    };

    let base_url = app.base_url();
    if let Err(rendered) = wait_ready(&base_url, harness_env::startup_timeout()).await {
        protocol::write_outcome(&home, &StepOutcome::Startup { rendered })?;
        let _ = app.shutdown().await;
        return Ok(());
    }

    *phase = Phase::Executing;
    tracing::debug!(phase = %*phase, step = %request.step, "executing step");
    let handle = AppHandle::new(base_url, home.clone(), harness_env::port()?, app.capabilities());
    let outcome = execute(&handler, handle, request).await;

    *phase = Phase::Finishing;
    tracing::debug!(phase = %*phase, "recording outcome");
    match &outcome {
        // Clean success with no return value is communicated by the absence
        // of an outcome file
        StepOutcome::Success { value: None } => {}
        _ => protocol::write_outcome(&home, &outcome)?,
    }

    if let Err(e) = app.shutdown().await {
        tracing::warn!(error = %e, "application shutdown reported an error");
    }

    *phase = Phase::ExitRequested;
    tracing::debug!(phase = %*phase, "remote bootstrap complete");
    Ok(())
}

/// Run the step handler, bounding it with the configured timeout and
/// capturing panics with their point of origin
async fn execute(handler: &StepHandler, app: AppHandle, request: StepRequest) -> StepOutcome {
    let timeout = request
        .timeout_secs
        .map(Duration::from_secs)
        .or_else(harness_env::step_timeout);

    let panic_slot = install_panic_capture();

    let mut task = tokio::spawn(handler.invoke(app, request.args));

    let joined = if let Some(limit) = timeout {
        tokio::select! {
            joined = &mut task => joined,
            _ = tokio::time::sleep(limit) => {
                task.abort();
                let failure = RemoteFailure::new(
                    "timeout",
                    format!(
                        "step '{}' did not complete within {}s; its thread was interrupted",
                        handler.name(),
                        limit.as_secs()
                    ),
                )
                .with_location(handler.location());
                return StepOutcome::Failure { failure };
            }
        }
    } else {
        (&mut task).await
    };

    match joined {
        Ok(Ok(value)) => StepOutcome::Success { value },
        Ok(Err(StepError::Assumption(reason))) => StepOutcome::Skipped { reason },
        Ok(Err(StepError::Failed(err))) => {
            let failure = RemoteFailure::from_error("error", err.as_ref())
                .with_location(handler.location());
            StepOutcome::Failure { failure }
        }
        Err(join_err) if join_err.is_panic() => {
            let captured = panic_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            let failure = captured.unwrap_or_else(|| {
                RemoteFailure::from_panic(panic_message(join_err))
                    .with_location(handler.location())
            });
            StepOutcome::Failure { failure }
        }
        Err(_) => StepOutcome::Failure {
            failure: RemoteFailure::new("cancelled", "step task was cancelled")
                .with_location(handler.location()),
        },
    }
}

/// Install a panic hook that records the panic site and backtrace
///
/// The child executes exactly one step per process, so the global hook is
/// never contended.
fn install_panic_capture() -> Arc<Mutex<Option<RemoteFailure>>> {
    let slot = Arc::new(Mutex::new(None));
    let captured = slot.clone();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());

        let mut failure = RemoteFailure::from_panic(message);
        if let Some(location) = info.location() {
            failure = failure.with_location(format!("{}:{}", location.file(), location.line()));
        }
        *captured.lock().unwrap_or_else(|e| e.into_inner()) = Some(failure);

        // Keep the default rendering on stderr for the parent's relay
        previous(info);
    }));
    slot
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}

/// Poll the application until it answers with a success status
///
/// On timeout the most recent response - status line plus a body excerpt,
/// which for busy or erroring servers is the rendered wait/error page - is
/// returned for the startup failure.
async fn wait_ready(base_url: &str, timeout: Duration) -> std::result::Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(READY_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| format!("failed to build readiness probe client: {}", e))?;

    let deadline = Instant::now() + timeout;
    let mut last_response: Option<String> = None;

    loop {
        if Instant::now() >= deadline {
            return Err(format!(
                "application at {} not ready within {}s; last response: {}",
                base_url,
                timeout.as_secs(),
                last_response.as_deref().unwrap_or("none")
            ));
        }

        match client.get(base_url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = base_url, "application ready");
                return Ok(());
            }
            Ok(response) => {
                let status = response.status();
                let mut body = response.text().await.unwrap_or_default();
                body.truncate(READY_BODY_EXCERPT);
                last_response = Some(format!("{}: {}", status, body.trim()));
            }
            Err(e) => {
                last_response = Some(e.to_string());
            }
        }

        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering_and_display() {
        let phases = [
            Phase::AwaitingStep,
            Phase::Decoding,
            Phase::Executing,
            Phase::Finishing,
            Phase::ExitRequested,
        ];
        let rendered: Vec<String> = phases.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            rendered,
            [
                "awaiting-step",
                "decoding",
                "executing",
                "finishing",
                "exit-requested"
            ]
        );
    }

    #[test]
    fn test_capability_query_is_explicit() {
        let mut capabilities = HashMap::new();
        capabilities.insert("records".to_string(), "v2".to_string());
        let handle = AppHandle::new(
            "http://127.0.0.1:1/".to_string(),
            PathBuf::from("/tmp"),
            1,
            capabilities,
        );

        assert_eq!(handle.capability("records"), Some("v2"));
        assert!(handle.supports("records"));
        assert_eq!(handle.capability("metrics"), None);
        assert!(!handle.supports("metrics"));
    }

    async fn refuse_boot(_: AppContext) -> Result<Box<dyn HostedApp>> {
        Err(Error::Internal("boot must not run".to_string()))
    }

    #[tokio::test]
    async fn test_bootstrap_refuses_to_run_without_hook() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(harness_env::HOME, dir.path());

        let mut phase = Phase::AwaitingStep;
        let result = run_inner(
            StepResolver::new(StepRegistry::new("app")),
            refuse_boot,
            &mut phase,
        )
        .await;
        std::env::remove_var(harness_env::HOME);

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got: {err}");
        assert!(err.to_string().contains("hook file missing"));
        // The failure is attributable to the phase it happened in
        assert_eq!(phase, Phase::AwaitingStep);
    }

    #[tokio::test]
    async fn test_wait_ready_reports_last_connection_error() {
        // Nothing listens on this port; the probe should time out quickly
        // and include the connection failure in the rendering.
        let err = wait_ready("http://127.0.0.1:1/", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.contains("not ready within"), "got: {err}");
    }
}
