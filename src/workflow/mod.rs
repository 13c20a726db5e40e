//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading,
//! validating and planning workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (steps, definitions, run records)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Optional structural and cycle checks
//! - [`resolver`]: Ready-set computation and wave planning

pub mod model;
pub mod parser;
pub mod resolver;
pub mod validator;

pub use model::{
    Context, Params, StepResult, StepState, WorkflowDefinition, WorkflowResult, WorkflowState,
    WorkflowStep,
};
pub use parser::{load_definition, parse_definition, DefinitionError};
pub use resolver::{plan_waves, ready_steps, WavePlan};
pub use validator::{validate_definition, ValidationError};
