//! WaveRunner - Wave-Scheduled Workflow Execution Engine
//!
//! Runs workflows made of named steps with dependencies. Steps whose
//! dependencies are resolved run together as a wave under an engine-wide
//! concurrency limit, each with its own retries, exponential backoff and
//! timeout. Runs can be paused, resumed, cancelled and queried while they
//! execute.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`workflow`]: Definitions, loading, validation and dependency resolution
//! - [`execution`]: Action registry, retry controller and wave scheduler
//! - [`monitoring`]: Timeline reports for finished runs
//!
//! # Example
//!
//! ```rust,no_run
//! use waverunner::execution::register_builtins;
//! use waverunner::workflow::Context;
//! use waverunner::{load_definition, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let definition = load_definition("pipeline.yaml")?;
//!
//!     // Create the engine and install the built-in actions
//!     let engine = Engine::new(4);
//!     register_builtins(engine.registry());
//!
//!     // Execute the workflow
//!     let result = engine.execute(&definition, Context::new()).await?;
//!     println!("{} finished as {}", result.workflow_id, result.state);
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use execution::{ActionRegistry, Engine, EngineConfig, EngineError, StepContext};
pub use workflow::model::{WorkflowDefinition, WorkflowResult, WorkflowState, WorkflowStep};
pub use workflow::parser::load_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "WaveRunner";
