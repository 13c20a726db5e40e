//! Execution Errors
//!
//! Step-level failures are values recorded on a [`StepResult`]; engine-level
//! errors are returned to the caller of `Engine::execute`.
//!
//! [`StepResult`]: crate::workflow::StepResult

use thiserror::Error;

/// Error type returned by action handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Why a single step attempt failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// No handler is registered under the action name
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// The attempt exceeded the step timeout (seconds)
    #[error("Step timed out after {0} seconds")]
    Timeout(f64),

    /// The handler returned an error
    #[error("{0}")]
    Handler(String),

    /// The run was cancelled before the step could finish
    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Concurrency limiter closed")]
    LimiterClosed,
}

impl StepError {
    /// Wraps a handler error.
    pub fn from_handler(err: HandlerError) -> Self {
        Self::Handler(err.to_string())
    }

    /// Returns true for failures that another attempt cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::UnknownAction(_))
    }
}

/// Errors returned by the engine itself rather than by a step.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A run with the same id has not finished yet
    #[error("Workflow '{0}' is already running")]
    AlreadyRunning(String),

    /// The run record disappeared while the run was in flight
    #[error("Workflow '{0}' is not tracked by this engine")]
    UnknownRun(String),

    /// A spawned step task panicked or was aborted
    #[error("Step task in workflow '{workflow_id}' failed: {message}")]
    StepTask { workflow_id: String, message: String },
}
