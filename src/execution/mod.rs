//! Workflow Execution Module
//!
//! Provides the engine that runs workflows: action handlers, the retry
//! controller, wave scheduling and run control.
//!
//! # Architecture
//!
//! - [`engine`]: Wave scheduler, run table and pause/resume/cancel
//! - [`retry`]: Per-step retry loop with timeout and backoff
//! - [`registry`]: Action name to handler mapping
//! - [`builtin`]: General-purpose actions used by the command line host
//! - [`error`]: Step and engine error types

pub mod builtin;
pub mod engine;
pub mod error;
pub mod registry;
pub mod retry;

pub use builtin::{register_builtins, BUILTIN_ACTIONS};
pub use engine::{Engine, EngineConfig, DEFAULT_MAX_CONCURRENT_STEPS};
pub use error::{EngineError, HandlerError, StepError};
pub use registry::{ActionRegistry, Handler, HandlerFuture, StepContext};
pub use retry::backoff_delay;
