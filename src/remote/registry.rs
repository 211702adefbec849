//! Step handler registration and resolution
//!
//! Handlers are registered by name against a registry; the remote bootstrap
//! resolves the pending step through an ordered chain of registries (the
//! application's own first, then any the embedding binary contributes).
//! A name found in no registry is a protocol error, never confused with a
//! failure of the step itself.

use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::remote::AppHandle;

/// What a step handler may surface
#[derive(Debug)]
pub enum StepError {
    /// A precondition was not met; reported as a skip, not a failure
    Assumption(String),
    /// The step's own logic failed
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
    /// Signal that a precondition was not met
    pub fn assumption(reason: impl Into<String>) -> Self {
        Self::Assumption(reason.into())
    }

    /// Fail the step with a plain message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(Box::new(Message(message.into())))
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for StepError {
    fn from(err: E) -> Self {
        Self::Failed(Box::new(err))
    }
}

/// Message-only step failure
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// Result type returned by step handlers
pub type StepResult = std::result::Result<Option<Value>, StepError>;

type HandlerFn = dyn Fn(AppHandle, Value) -> BoxFuture<'static, StepResult> + Send + Sync;

/// A registered step handler with its defining source location
#[derive(Clone)]
pub struct StepHandler {
    name: String,
    location: &'static Location<'static>,
    f: Arc<HandlerFn>,
}

impl StepHandler {
    /// Registered name of the step
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source location where the handler was registered
    pub fn location(&self) -> String {
        format!("{}:{}", self.location.file(), self.location.line())
    }

    /// Invoke the handler against the live application
    pub fn invoke(&self, app: AppHandle, args: Value) -> BoxFuture<'static, StepResult> {
        (self.f)(app, args)
    }
}

impl std::fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandler")
            .field("name", &self.name)
            .field("location", &self.location())
            .finish()
    }
}

/// Named collection of step handlers
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    name: String,
    handlers: HashMap<String, StepHandler>,
}

impl StepRegistry {
    /// Create an empty registry; the name appears in resolution errors
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    /// Registry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler under a step name
    ///
    /// The caller's source location is recorded so a failing step can be
    /// attributed to its defining site.
    #[track_caller]
    pub fn register<F, Fut>(&mut self, step: &str, handler: F)
    where
        F: Fn(AppHandle, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        let location = Location::caller();
        let f: Arc<HandlerFn> = Arc::new(move |app, args| Box::pin(handler(app, args)));
        self.handlers.insert(
            step.to_string(),
            StepHandler {
                name: step.to_string(),
                location,
                f,
            },
        );
    }

    /// Look up a handler by step name
    pub fn get(&self, step: &str) -> Option<&StepHandler> {
        self.handlers.get(step)
    }

    /// Whether a handler is registered under this name
    pub fn contains(&self, step: &str) -> bool {
        self.handlers.contains_key(step)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Ordered chain of registries consulted during remote step decoding
///
/// The primary registry is the receiving application's own; fallbacks are
/// supplementary sets the sender's side contributed to the child binary.
#[derive(Debug, Clone)]
pub struct StepResolver {
    registries: Vec<StepRegistry>,
}

impl StepResolver {
    /// Create a resolver with the application's primary registry
    pub fn new(primary: StepRegistry) -> Self {
        Self {
            registries: vec![primary],
        }
    }

    /// Append a supplementary registry consulted after earlier ones
    pub fn with_fallback(mut self, registry: StepRegistry) -> Self {
        self.registries.push(registry);
        self
    }

    /// Resolve a step name to its handler
    pub fn resolve(&self, step: &str) -> Result<&StepHandler> {
        for registry in &self.registries {
            if let Some(handler) = registry.get(step) {
                return Ok(handler);
            }
        }
        let searched: Vec<&str> = self.registries.iter().map(|r| r.name()).collect();
        Err(Error::handler_not_found(step, &searched))
    }
}
