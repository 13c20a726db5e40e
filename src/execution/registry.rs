//! Action Registry
//!
//! Maps action names to async handlers. The retry controller resolves the
//! handler once per attempt, so handlers registered after the engine starts
//! are picked up by later attempts.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::HandlerError;
use crate::workflow::{Context, Params};

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// A registered action handler.
pub type Handler = Arc<dyn Fn(Params, StepContext) -> HandlerFuture + Send + Sync>;

/// Per-attempt information handed to a handler alongside its params.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Workflow the step belongs to (empty for standalone steps)
    pub workflow_id: String,
    pub step_id: String,
    /// Workflow-wide context map shared by every step of the run
    pub vars: Arc<Context>,
    /// Tripped when the run is cancelled
    pub cancellation: CancellationToken,
}

impl StepContext {
    /// Creates a context with a fresh cancellation token.
    pub fn new(workflow_id: impl Into<String>, step_id: impl Into<String>, vars: Context) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            vars: Arc::new(vars),
            cancellation: CancellationToken::new(),
        }
    }

    /// Looks up a workflow context value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Returns true once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Thread-safe name to handler table.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Handler>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Handler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an async handler under `name`, replacing any previous one.
    ///
    /// # Example
    ///
    /// ```
    /// use serde_json::Value;
    /// use waverunner::execution::{ActionRegistry, HandlerError, StepContext};
    /// use waverunner::workflow::Params;
    ///
    /// async fn greet(params: Params, ctx: StepContext) -> Result<Value, HandlerError> {
    ///     let name = params.get("name").and_then(Value::as_str).unwrap_or("world");
    ///     Ok(Value::from(format!("hello {name} from {}", ctx.step_id)))
    /// }
    ///
    /// let registry = ActionRegistry::new();
    /// registry.register("greet", greet);
    /// assert!(registry.contains("greet"));
    /// ```
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Params, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler =
            Arc::new(move |params: Params, ctx: StepContext| -> HandlerFuture {
                Box::pin(handler(params, ctx))
            });

        if self.write().insert(name.clone(), handler).is_some() {
            debug!("Replaced handler for action '{}'", name);
        } else {
            debug!("Registered action '{}'", name);
        }
    }

    /// Looks up the handler for an action.
    pub fn resolve(&self, name: &str) -> Option<Handler> {
        self.read().get(name).cloned()
    }

    /// Removes a handler, returning true if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Returns true if a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Returns the registered action names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
